// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::errors::DecodeError;

/// Upper bound for a single decompressed payload. Anything larger is rejected
/// instead of being cut short.
pub const MAX_DECOMPRESSED_BYTES: usize = 32 * 1024 * 1024;

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates a gzip stream, failing on corrupt input or on output past
/// [`MAX_DECOMPRESSED_BYTES`].
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    gunzip_with_limit(data, MAX_DECOMPRESSED_BYTES)
}

pub(crate) fn gunzip_with_limit(data: &[u8], limit: usize) -> Result<Vec<u8>, DecodeError> {
    let decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(limit));
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(DecodeError::Decompression)?;
    if out.len() > limit {
        return Err(DecodeError::DecompressedTooLarge { limit });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_then_gunzip() {
        let data = b"resource_spans".repeat(64);
        let compressed = gzip(&data).unwrap();
        assert_ne!(compressed, data);
        assert_eq!(gunzip(&compressed).unwrap(), data);
    }

    #[test]
    fn test_gunzip_rejects_plain_bytes() {
        let err = gunzip(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, DecodeError::Decompression(_)));
    }

    #[test]
    fn test_gunzip_enforces_limit() {
        let compressed = gzip(&[0u8; 2048]).unwrap();
        let err = gunzip_with_limit(&compressed, 1024).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::DecompressedTooLarge { limit: 1024 }
        ));
        assert_eq!(gunzip_with_limit(&compressed, 2048).unwrap().len(), 2048);
    }
}
