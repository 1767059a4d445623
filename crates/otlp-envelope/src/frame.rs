// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport record framing: newline-terminated envelope lines.

use bytes::Bytes;

use crate::envelope::SpanEnvelope;
use crate::errors::{DecodeError, EncodeError};

/// Per-record ceiling of the ordered stream (1 MiB).
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

pub const RECORD_DELIMITER: u8 = b'\n';

/// Accumulates envelope lines into a single transport record without ever
/// crossing the byte ceiling.
#[derive(Debug)]
pub struct RecordBuilder {
    buf: Vec<u8>,
    lines: usize,
    limit: usize,
}

impl RecordBuilder {
    pub fn new(limit: usize) -> Self {
        RecordBuilder {
            buf: Vec::new(),
            lines: 0,
            limit,
        }
    }

    /// Bytes a line occupies once framed.
    pub fn framed_len(line: &str) -> usize {
        line.len() + 1
    }

    /// Whether a line of this length could ever fit, even in an empty record.
    pub fn admits(&self, line: &str) -> bool {
        Self::framed_len(line) <= self.limit
    }

    pub fn has_room_for(&self, line: &str) -> bool {
        self.buf.len() + Self::framed_len(line) <= self.limit
    }

    /// Appends a line, refusing it when the record would cross the ceiling.
    pub fn push_line(&mut self, line: &str) -> Result<(), EncodeError> {
        if !self.has_room_for(line) {
            return Err(EncodeError::RecordTooLarge {
                size: self.buf.len() + Self::framed_len(line),
                limit: self.limit,
            });
        }
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.push(RECORD_DELIMITER);
        self.lines += 1;
        Ok(())
    }

    pub fn push(&mut self, envelope: &SpanEnvelope) -> Result<(), EncodeError> {
        let line = envelope.to_line()?;
        self.push_line(&line)
    }

    pub fn len(&self) -> usize {
        self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }

    pub fn byte_len(&self) -> usize {
        self.buf.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Hands out the framed record and resets the builder.
    pub fn take(&mut self) -> Option<Bytes> {
        if self.is_empty() {
            return None;
        }
        self.lines = 0;
        Some(Bytes::from(std::mem::take(&mut self.buf)))
    }
}

/// Splits a transport record back into envelopes.
///
/// Blank lines are skipped. Any bad line fails the whole record, reporting
/// which line (1-based) was at fault.
pub fn split_record(record: &[u8]) -> Result<Vec<SpanEnvelope>, DecodeError> {
    let text = std::str::from_utf8(record).map_err(|_| DecodeError::NotUtf8)?;
    let mut envelopes = Vec::new();
    for (idx, line) in text.split(RECORD_DELIMITER as char).enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let envelope = SpanEnvelope::from_line(line).map_err(|e| DecodeError::InRecord {
            line: idx + 1,
            source: Box::new(e),
        })?;
        envelopes.push(envelope);
    }
    if envelopes.is_empty() {
        return Err(DecodeError::EmptyRecord);
    }
    Ok(envelopes)
}
