// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::envelope::ContentType;

/// Failures while turning channel lines or transport records back into envelopes.
///
/// Every variant means the input is dropped; none of them is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope line: {0}")]
    MalformedLine(#[from] serde_json::Error),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("unsupported content encoding: {0}")]
    UnsupportedContentEncoding(String),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("raw text payload is only allowed for uncompressed JSON")]
    RawBinaryPayload,

    #[error("payload declared gzip but failed to decompress: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("decompressed payload exceeds {limit} bytes")]
    DecompressedTooLarge { limit: usize },

    #[error("payload is not a valid {content_type} export request: {reason}")]
    InvalidPayload {
        content_type: ContentType,
        reason: String,
    },

    #[error("record is not valid UTF-8")]
    NotUtf8,

    #[error("record contains no envelopes")]
    EmptyRecord,

    #[error("line {line} of record: {source}")]
    InRecord {
        line: usize,
        #[source]
        source: Box<DecodeError>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encoded size of {size} bytes exceeds the {limit} byte record ceiling")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("failed to compress payload: {0}")]
    Compression(#[from] std::io::Error),

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("payload rejected: {0}")]
    InvalidPayload(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_record_error_names_line() {
        let err = DecodeError::InRecord {
            line: 3,
            source: Box::new(DecodeError::UnsupportedContentType("text/plain".into())),
        };
        assert_eq!(
            err.to_string(),
            "line 3 of record: unsupported content type: text/plain"
        );
    }

    #[test]
    fn test_record_too_large_display() {
        let err = EncodeError::RecordTooLarge {
            size: 2048,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "encoded size of 2048 bytes exceeds the 1024 byte record ceiling"
        );
    }
}
