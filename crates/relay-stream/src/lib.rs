// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ordered, at-least-once stream sitting between the capture agent and the
//! forwarder.
//!
//! The stream itself is a managed service; this crate only fixes the contract
//! both sides program against, plus two local implementations: an in-memory
//! log used by tests and self-hosted setups, and an appender that writes one
//! record per line to stdout for hosts whose log service is the durable log.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub mod memory;
pub mod stdout;

pub use memory::MemoryStream;
pub use stdout::{parse_record_line, StdoutTransport};

/// Identifier of a record within the stream (a sequence number).
pub type RecordId = String;

/// Opaque record bytes plus the key selecting its partition. Ordering holds
/// within a partition only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRecord {
    pub record_id: RecordId,
    pub partition_key: String,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceToken(pub String);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("stream unavailable: {0}")]
    Unavailable(String),

    #[error("record of {size} bytes exceeds the {limit} byte ceiling")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("append rejected: {0}")]
    Rejected(String),

    #[error("stream closed")]
    Closed,
}

impl TransportError {
    /// Whether a later attempt with the same record can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// Producer side of the stream.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn append(&self, partition_key: &str, data: Bytes)
        -> Result<SequenceToken, TransportError>;
}

/// Consumer side of the stream.
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Returns up to `max_records` records past each partition's position,
    /// waiting at most `max_wait` for the first one to show up. Records stay
    /// visible to later polls until acknowledged.
    async fn poll(
        &self,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<StreamRecord>, TransportError>;

    /// Advances the partition's position past `record_id`.
    async fn ack(&self, partition_key: &str, record_id: &str) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(TransportError::Unavailable("throttled".into()).is_retryable());
        assert!(!TransportError::Closed.is_retryable());
        assert!(!TransportError::Rejected("bad key".into()).is_retryable());
        assert!(!TransportError::RecordTooLarge { size: 2, limit: 1 }.is_retryable());
    }

    #[test]
    fn test_broken_pipe_means_closed() {
        let err: TransportError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, TransportError::Closed));
        let err: TransportError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert!(err.is_retryable());
    }
}
