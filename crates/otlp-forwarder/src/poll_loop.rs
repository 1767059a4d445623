// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-polling mode for hosts that do not push batches: poll the stream,
//! process, then advance each partition up to its first record that still
//! needs delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_stream::{StreamConsumer, TransportError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ForwarderConfig;
use crate::forwarder::{BatchReport, ForwardingEngine, RecordOutcome};

const MIN_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub max_records: usize,
    pub max_wait: Duration,
    pub budget: Duration,
}

impl PollSettings {
    pub fn from_config(config: &ForwarderConfig) -> Self {
        PollSettings {
            max_records: config.max_poll_records,
            max_wait: config.max_poll_wait,
            budget: config.poll_budget,
        }
    }
}

/// The last record of each partition that may be acknowledged: the one just
/// before the first record needing redelivery, or the partition's last record
/// when none does. Partitions whose first record needs redelivery are absent.
pub fn ack_positions(outcomes: &[RecordOutcome]) -> HashMap<&str, &str> {
    let mut blocked: Vec<&str> = Vec::new();
    let mut positions: HashMap<&str, &str> = HashMap::new();
    for outcome in outcomes {
        let partition = outcome.partition_key.as_str();
        if blocked.contains(&partition) {
            continue;
        }
        if outcome.outcome.is_retryable() {
            blocked.push(partition);
        } else {
            positions.insert(partition, outcome.record_id.as_str());
        }
    }
    positions
}

/// Polls once, processes what came back and advances the stream.
pub async fn poll_once(
    consumer: &dyn StreamConsumer,
    engine: &Arc<ForwardingEngine>,
    settings: PollSettings,
) -> Result<BatchReport, TransportError> {
    let records = consumer
        .poll(settings.max_records, settings.max_wait)
        .await?;
    if records.is_empty() {
        return Ok(BatchReport::default());
    }

    let deadline = Instant::now() + settings.budget;
    let report = engine.process_batch(records, deadline).await;
    for (partition, record_id) in ack_positions(&report.outcomes) {
        consumer.ack(partition, record_id).await?;
        debug!("advanced partition {partition} to {record_id}");
    }
    info!("poll done: {report}");
    Ok(report)
}

/// Polls until cancelled. Transient stream failures and batches that left
/// records for redelivery pause the loop with exponential backoff; anything
/// else ends it.
pub async fn run_poll_loop(
    consumer: Arc<dyn StreamConsumer>,
    engine: Arc<ForwardingEngine>,
    settings: PollSettings,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let mut backoff = MIN_RETRY_BACKOFF;
    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            result = poll_once(consumer.as_ref(), &engine, settings) => result,
        };
        match result {
            Ok(report) if report.retryable() == 0 => {
                backoff = MIN_RETRY_BACKOFF;
                continue;
            }
            Ok(report) => {
                warn!(
                    "{} records need redelivery, polling again in {backoff:?}",
                    report.retryable()
                );
            }
            Err(e) if e.is_retryable() => {
                warn!("stream poll failed, retrying in {backoff:?}: {e}");
            }
            Err(e) => {
                error!("stream poll failed: {e}");
                return Err(e);
            }
        }
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_cache::CredentialCache;
    use crate::credentials::InMemorySecretStore;
    use crate::delivery::CollectorClient;
    use crate::forwarder::DeliveryOutcome;
    use crate::router::Router;
    use bytes::Bytes;
    use mockito::Server;
    use otlp_envelope::{ContentEncoding, ContentType, SpanEnvelope};
    use relay_stream::{MemoryStream, StreamTransport};

    fn outcome(partition: &str, id: &str, outcome: DeliveryOutcome) -> RecordOutcome {
        RecordOutcome {
            record_id: id.to_string(),
            partition_key: partition.to_string(),
            outcome,
        }
    }

    #[test]
    fn test_ack_positions_stop_before_first_retry() {
        let retry = || DeliveryOutcome::Retryable("503".to_string());
        let outcomes = vec![
            outcome("a", "1", DeliveryOutcome::Delivered),
            outcome("b", "2", retry()),
            outcome("a", "3", DeliveryOutcome::Dropped("decode".to_string())),
            outcome("b", "4", DeliveryOutcome::Delivered),
            outcome("a", "5", retry()),
            outcome("a", "6", DeliveryOutcome::Delivered),
            outcome("c", "7", DeliveryOutcome::Delivered),
        ];
        let positions = ack_positions(&outcomes);
        assert_eq!(positions.get("a"), Some(&"3"));
        assert_eq!(positions.get("b"), None);
        assert_eq!(positions.get("c"), Some(&"7"));
    }

    fn line(vendor: &str) -> Bytes {
        let line = SpanEnvelope::new("checkout", ContentType::Protobuf, ContentEncoding::Gzip, &[])
            .unwrap()
            .with_vendor(vendor)
            .to_line()
            .unwrap();
        Bytes::from(line)
    }

    #[tokio::test]
    async fn test_poll_once_leaves_retryable_tail_pending() {
        let mut server = Server::new_async().await;
        let _collector = server
            .mock("POST", "/v1/traces")
            .with_status(200)
            .create_async()
            .await;
        let store = Arc::new(InMemorySecretStore::new());
        store.insert("good", &server.url(), "x-api-key=k");
        let engine = Arc::new(ForwardingEngine::new(
            Arc::new(CredentialCache::new(
                store,
                Duration::from_secs(300),
                Duration::from_secs(60),
            )),
            CollectorClient::new(reqwest::Client::new(), Duration::from_secs(5)),
            Router::new("good"),
        ));

        let stream = MemoryStream::default();
        stream.append("fn-a", line("good")).await.unwrap();
        let stuck = stream.append("fn-a", line("missing")).await.unwrap();
        stream.append("fn-a", line("good")).await.unwrap();
        stream.append("fn-b", line("good")).await.unwrap();

        let settings = PollSettings {
            max_records: 10,
            max_wait: Duration::from_millis(10),
            budget: Duration::from_secs(10),
        };
        let report = poll_once(&stream, &engine, settings).await.unwrap();

        assert_eq!(report.delivered(), 3);
        assert_eq!(report.retryable(), 1);
        let pending = stream.pending("fn-a");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].record_id, stuck.0);
        assert!(stream.pending("fn-b").is_empty());
    }

    #[tokio::test]
    async fn test_poll_loop_stops_on_cancel() {
        let engine = Arc::new(ForwardingEngine::new(
            Arc::new(CredentialCache::new(
                Arc::new(InMemorySecretStore::new()),
                Duration::from_secs(300),
                Duration::from_secs(60),
            )),
            CollectorClient::new(reqwest::Client::new(), Duration::from_secs(5)),
            Router::new("default"),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_poll_loop(
            Arc::new(MemoryStream::default()),
            engine,
            PollSettings {
                max_records: 10,
                max_wait: Duration::from_millis(20),
                budget: Duration::from_secs(1),
            },
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_record_polled_with_backoff() {
        let store = Arc::new(InMemorySecretStore::new());
        let engine = Arc::new(ForwardingEngine::new(
            Arc::new(CredentialCache::new(
                store.clone(),
                Duration::from_secs(300),
                Duration::from_secs(60),
            )),
            CollectorClient::new(reqwest::Client::new(), Duration::from_secs(5)),
            Router::new("default"),
        ));
        let stream = MemoryStream::default();
        stream.append("fn-a", line("unknown")).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_poll_loop(
            Arc::new(stream.clone()),
            engine,
            PollSettings {
                max_records: 10,
                max_wait: Duration::from_millis(10),
                budget: Duration::from_secs(1),
            },
            cancel.clone(),
        ));

        // Polls at 0s, 0.5s, 1.5s, 3.5s and 7.5s.
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());

        let fetches = store.fetch_count();
        assert!((4..=6).contains(&fetches), "{fetches} fetches");
        assert_eq!(stream.pending("fn-a").len(), 1);
    }
}
