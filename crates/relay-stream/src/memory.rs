// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use crate::{RecordId, SequenceToken, StreamConsumer, StreamRecord, TransportError};

/// Ceiling of a single stream record, matching the managed stream's limit.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

#[derive(Default)]
struct Partition {
    // Records past the acknowledged position, oldest first.
    pending: VecDeque<StreamRecord>,
}

#[derive(Default)]
struct State {
    next_sequence: u64,
    partitions: BTreeMap<String, Partition>,
    injected_failures: usize,
    closed: bool,
}

/// In-memory ordered log implementing both sides of the stream.
///
/// Sequence numbers are global and strictly increasing, so ordering within a
/// partition follows append order. Records remain visible to `poll` until
/// acknowledged, which gives the at-least-once delivery of the real stream.
#[derive(Clone)]
pub struct MemoryStream {
    state: Arc<Mutex<State>>,
    appended: Arc<Notify>,
    max_record_bytes: usize,
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_BYTES)
    }
}

impl MemoryStream {
    pub fn new(max_record_bytes: usize) -> Self {
        MemoryStream {
            state: Arc::new(Mutex::new(State::default())),
            appended: Arc::new(Notify::new()),
            max_record_bytes,
        }
    }

    /// Makes the next `count` appends fail with `Unavailable`.
    pub fn fail_next_appends(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.injected_failures = count;
        }
    }

    /// Rejects every append from now on.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.appended.notify_waiters();
    }

    /// Unacknowledged records of one partition, in order.
    pub fn pending(&self, partition_key: &str) -> Vec<StreamRecord> {
        self.state
            .lock()
            .map(|state| {
                state
                    .partitions
                    .get(partition_key)
                    .map(|p| p.pending.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Unacknowledged records across all partitions, in sequence order.
    pub fn all_pending(&self) -> Vec<StreamRecord> {
        self.state
            .lock()
            .map(|state| collect_pending(&state, usize::MAX))
            .unwrap_or_default()
    }

    fn try_append(&self, partition_key: &str, data: Bytes) -> Result<RecordId, TransportError> {
        if data.len() > self.max_record_bytes {
            return Err(TransportError::RecordTooLarge {
                size: data.len(),
                limit: self.max_record_bytes,
            });
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("stream state poisoned".to_string()))?;
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            return Err(TransportError::Unavailable(
                "provisioned throughput exceeded".to_string(),
            ));
        }
        state.next_sequence += 1;
        let record_id = format!("{:020}", state.next_sequence);
        state
            .partitions
            .entry(partition_key.to_string())
            .or_default()
            .pending
            .push_back(StreamRecord {
                record_id: record_id.clone(),
                partition_key: partition_key.to_string(),
                data,
            });
        Ok(record_id)
    }
}

fn collect_pending(state: &State, max_records: usize) -> Vec<StreamRecord> {
    let mut records: Vec<StreamRecord> = state
        .partitions
        .values()
        .flat_map(|p| p.pending.iter().cloned())
        .collect();
    // Zero padded, so lexical order is sequence order.
    records.sort_by(|a, b| a.record_id.cmp(&b.record_id));
    records.truncate(max_records);
    records
}

#[async_trait]
impl crate::StreamTransport for MemoryStream {
    async fn append(
        &self,
        partition_key: &str,
        data: Bytes,
    ) -> Result<SequenceToken, TransportError> {
        let size = data.len();
        let record_id = self.try_append(partition_key, data)?;
        debug!("appended {size} bytes to partition {partition_key} as {record_id}");
        self.appended.notify_waiters();
        Ok(SequenceToken(record_id))
    }
}

#[async_trait]
impl StreamConsumer for MemoryStream {
    async fn poll(
        &self,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<StreamRecord>, TransportError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            // Register interest before looking so an append in between is not lost.
            let notified = self.appended.notified();
            {
                let state = self
                    .state
                    .lock()
                    .map_err(|_| TransportError::Unavailable("stream state poisoned".to_string()))?;
                let records = collect_pending(&state, max_records);
                if !records.is_empty() || state.closed {
                    return Ok(records);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, partition_key: &str, record_id: &str) -> Result<(), TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("stream state poisoned".to_string()))?;
        let Some(partition) = state.partitions.get_mut(partition_key) else {
            return Err(TransportError::Rejected(format!(
                "unknown partition {partition_key}"
            )));
        };
        while partition
            .pending
            .front()
            .is_some_and(|r| r.record_id.as_str() <= record_id)
        {
            partition.pending.pop_front();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamTransport;

    #[tokio::test]
    async fn test_order_within_partition_follows_appends() {
        let stream = MemoryStream::default();
        for i in 0..5u8 {
            stream.append("fn-a", Bytes::from(vec![i])).await.unwrap();
            stream.append("fn-b", Bytes::from(vec![100 + i])).await.unwrap();
        }
        let a: Vec<u8> = stream.pending("fn-a").iter().map(|r| r.data[0]).collect();
        assert_eq!(a, vec![0, 1, 2, 3, 4]);
        let b: Vec<u8> = stream.pending("fn-b").iter().map(|r| r.data[0]).collect();
        assert_eq!(b, vec![100, 101, 102, 103, 104]);
    }

    #[tokio::test]
    async fn test_records_redelivered_until_acked() {
        let stream = MemoryStream::default();
        stream.append("p", Bytes::from_static(b"one")).await.unwrap();
        let second = stream.append("p", Bytes::from_static(b"two")).await.unwrap();

        let first_poll = stream.poll(10, Duration::ZERO).await.unwrap();
        let again = stream.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(first_poll, again);
        assert_eq!(first_poll.len(), 2);

        stream.ack("p", &first_poll[0].record_id).await.unwrap();
        let rest = stream.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].record_id, second.0);
    }

    #[tokio::test]
    async fn test_poll_caps_record_count() {
        let stream = MemoryStream::default();
        for _ in 0..4 {
            stream.append("p", Bytes::from_static(b"x")).await.unwrap();
        }
        assert_eq!(stream.poll(3, Duration::ZERO).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_waits_for_first_append() {
        let stream = MemoryStream::default();
        let producer = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            producer.append("p", Bytes::from_static(b"late")).await.unwrap();
        });
        let records = stream.poll(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, Bytes::from_static(b"late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up_after_wait() {
        let stream = MemoryStream::default();
        let records = stream.poll(10, Duration::from_millis(50)).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_and_injected_failures() {
        let stream = MemoryStream::new(4);
        let err = stream
            .append("p", Bytes::from_static(b"too big"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RecordTooLarge { size: 7, limit: 4 }));

        stream.fail_next_appends(2);
        assert!(stream.append("p", Bytes::from_static(b"a")).await.is_err());
        assert!(stream.append("p", Bytes::from_static(b"a")).await.is_err());
        assert!(stream.append("p", Bytes::from_static(b"a")).await.is_ok());
        assert_eq!(stream.all_pending().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_appends() {
        let stream = MemoryStream::default();
        stream.close();
        let err = stream.append("p", Bytes::from_static(b"a")).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
