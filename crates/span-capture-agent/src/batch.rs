// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use otlp_envelope::{EncodeError, RecordBuilder, SpanEnvelope};
use tokio::time::Instant;

/// What closed a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushTrigger {
    MaxRecords,
    MaxWait,
    /// The next envelope would have pushed the record past its byte ceiling.
    Capacity,
    InvocationComplete,
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MaxRecords => "max-records",
            Self::MaxWait => "max-wait",
            Self::Capacity => "capacity",
            Self::InvocationComplete => "invocation-complete",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// A closed batch, framed as one transport record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedBatch {
    pub data: Bytes,
    pub envelopes: usize,
    pub trigger: FlushTrigger,
}

#[derive(Debug, thiserror::Error)]
pub enum Rejected {
    #[error("envelope of {size} bytes can never fit a {limit} byte record")]
    Oversized { size: usize, limit: usize },

    #[error("envelope could not be encoded: {0}")]
    Encode(#[from] EncodeError),
}

/// The open batch plus its count and time triggers.
#[derive(Debug)]
pub struct Batcher {
    record: RecordBuilder,
    max_records: usize,
    max_wait: Duration,
    opened_at: Option<Instant>,
}

impl Batcher {
    pub fn new(max_records: usize, max_wait: Duration, max_record_bytes: usize) -> Self {
        Batcher {
            record: RecordBuilder::new(max_record_bytes),
            max_records,
            max_wait,
            opened_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.record.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }

    /// When the time trigger fires for the open batch, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.max_wait)
    }

    /// Adds an envelope, returning every batch this closed, oldest first.
    ///
    /// A full record is sealed before the envelope is placed so an envelope
    /// is never split across records.
    pub fn push(
        &mut self,
        envelope: &SpanEnvelope,
        now: Instant,
    ) -> Result<Vec<SealedBatch>, Rejected> {
        let line = envelope.to_line()?;
        if !self.record.admits(&line) {
            return Err(Rejected::Oversized {
                size: RecordBuilder::framed_len(&line),
                limit: self.record.limit(),
            });
        }

        let mut sealed = Vec::new();
        if !self.record.has_room_for(&line) {
            sealed.extend(self.seal(FlushTrigger::Capacity));
        }
        self.record.push_line(&line)?;
        self.opened_at.get_or_insert(now);
        if self.record.len() >= self.max_records {
            sealed.extend(self.seal(FlushTrigger::MaxRecords));
        }
        Ok(sealed)
    }

    /// Closes the open batch, if it holds anything.
    pub fn seal(&mut self, trigger: FlushTrigger) -> Option<SealedBatch> {
        let envelopes = self.record.len();
        let data = self.record.take()?;
        self.opened_at = None;
        Some(SealedBatch {
            data,
            envelopes,
            trigger,
        })
    }
}
