// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters of the agent, shared between the source reader and the
/// agent loop.
#[derive(Debug, Default)]
pub struct Diagnostics {
    envelopes_received: AtomicU64,
    decode_errors: AtomicU64,
    oversized_dropped: AtomicU64,
    batches_appended: AtomicU64,
    append_retries: AtomicU64,
    batches_dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub envelopes_received: u64,
    pub decode_errors: u64,
    pub oversized_dropped: u64,
    pub batches_appended: u64,
    pub append_retries: u64,
    pub batches_dropped: u64,
}

impl Diagnostics {
    pub fn envelope_received(&self) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn oversized_dropped(&self) {
        self.oversized_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_appended(&self) {
        self.batches_appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn append_retried(&self) {
        self.append_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            oversized_dropped: self.oversized_dropped.load(Ordering::Relaxed),
            batches_appended: self.batches_appended.load(Ordering::Relaxed),
            append_retries: self.append_retries.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for DiagnosticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "envelopes_received={} decode_errors={} oversized_dropped={} batches_appended={} append_retries={} batches_dropped={}",
            self.envelopes_received,
            self.decode_errors,
            self.oversized_dropped,
            self.batches_appended,
            self.append_retries,
            self.batches_dropped
        )
    }
}
