// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The envelope line format.
//!
//! One envelope is one JSON object on one line:
//!
//! ```text
//! {"__otel_otlp_stdout":"otlp-envelope@0.1.0","source":"quotes","content-type":"application/x-protobuf",
//!  "content-encoding":"gzip","payload":"H4sIAAAAAAAAAAMAAAAAAAAAAAA=","base64":true}
//! ```
//!
//! Producers may add fields such as `endpoint`, `method` or `headers`; they are
//! accepted and ignored. `vendor` is optional and selects the destination on
//! the forwarding side.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::compression::{gunzip, gzip};
use crate::errors::{DecodeError, EncodeError};
use crate::validate::validate_payload;

/// Field that marks a line as an envelope.
pub const ENVELOPE_MARKER: &str = "__otel_otlp_stdout";

/// Field that marks a line as a control message from the instrumented function.
pub const CONTROL_MARKER: &str = "__otel_otlp_stdout_control";

pub const INVOCATION_COMPLETE: &str = "invocation-complete";

const PRODUCER: &str = concat!("otlp-envelope@", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentType {
    Protobuf,
    Json,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Protobuf => "application/x-protobuf",
            Self::Json => "application/json",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // parameters such as `; charset=utf-8` do not change the payload format
        let essence = s.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/x-protobuf" | "application/protobuf" => Ok(Self::Protobuf),
            "application/json" => Ok(Self::Json),
            _ => Err(DecodeError::UnsupportedContentType(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ContentEncoding {
    Gzip,
    #[default]
    Identity,
}

impl ContentEncoding {
    fn parse(value: Option<&str>) -> Result<Self, DecodeError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::Identity),
            Some(v) if v.eq_ignore_ascii_case("gzip") => Ok(Self::Gzip),
            Some(v) if v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("identity") => {
                Ok(Self::Identity)
            }
            Some(v) => Err(DecodeError::UnsupportedContentEncoding(v.to_string())),
        }
    }

    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            Self::Gzip => Some("gzip"),
            Self::Identity => None,
        }
    }
}

/// One compressed, content-typed telemetry export request.
///
/// `payload` holds the bytes exactly as carried on the wire, i.e. still
/// gzip-compressed when `content_encoding` is [`ContentEncoding::Gzip`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanEnvelope {
    pub source: String,
    pub vendor: Option<String>,
    pub content_type: ContentType,
    pub content_encoding: ContentEncoding,
    pub payload: Bytes,
}

#[derive(Serialize, Deserialize)]
struct WireLine {
    #[serde(rename = "__otel_otlp_stdout")]
    producer: String,
    source: String,
    #[serde(rename = "content-type")]
    content_type: String,
    #[serde(
        rename = "content-encoding",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    content_encoding: Option<String>,
    payload: String,
    #[serde(default)]
    base64: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vendor: Option<String>,
}

#[derive(Deserialize)]
struct ControlLine {
    #[serde(rename = "__otel_otlp_stdout_control")]
    control: String,
}

/// What the instrumented function can send over the local channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMessage {
    Envelope(SpanEnvelope),
    InvocationComplete,
}

impl ChannelMessage {
    /// Parses one channel line. Control lines are recognised first; anything
    /// else must be a valid envelope.
    pub fn parse_line(line: &str) -> Result<Self, DecodeError> {
        if line.contains(CONTROL_MARKER) {
            if let Ok(control) = serde_json::from_str::<ControlLine>(line) {
                if control.control == INVOCATION_COMPLETE {
                    return Ok(Self::InvocationComplete);
                }
                tracing::debug!("Ignoring unknown control message {}", control.control);
            }
        }
        SpanEnvelope::from_line(line).map(Self::Envelope)
    }

    pub fn invocation_complete_line() -> String {
        format!("{{\"{CONTROL_MARKER}\":\"{INVOCATION_COMPLETE}\"}}")
    }
}

impl SpanEnvelope {
    /// Builds an envelope from an uncompressed export request, gzipping it when
    /// asked to. The payload is validated first so producers cannot emit an
    /// envelope the forwarder would reject.
    pub fn new(
        source: impl Into<String>,
        content_type: ContentType,
        content_encoding: ContentEncoding,
        raw_payload: &[u8],
    ) -> Result<Self, EncodeError> {
        validate_payload(content_type, raw_payload)?;
        let payload = match content_encoding {
            ContentEncoding::Gzip => Bytes::from(gzip(raw_payload)?),
            ContentEncoding::Identity => Bytes::copy_from_slice(raw_payload),
        };
        Ok(Self {
            source: source.into(),
            vendor: None,
            content_type,
            content_encoding,
            payload,
        })
    }

    #[must_use]
    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    /// Returns the export request bytes with any content encoding removed.
    pub fn decompressed_payload(&self) -> Result<Vec<u8>, DecodeError> {
        match self.content_encoding {
            ContentEncoding::Gzip => gunzip(&self.payload),
            ContentEncoding::Identity => Ok(self.payload.to_vec()),
        }
    }

    /// Vendor tag with empty values treated as absent.
    pub fn vendor_tag(&self) -> Option<&str> {
        self.vendor.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    /// Decodes and validates one envelope line.
    pub fn from_line(line: &str) -> Result<Self, DecodeError> {
        let wire: WireLine = serde_json::from_str(line.trim())?;
        let content_type = ContentType::from_str(&wire.content_type)?;
        let content_encoding = ContentEncoding::parse(wire.content_encoding.as_deref())?;

        let payload = if wire.base64 {
            Bytes::from(STANDARD.decode(wire.payload.as_bytes())?)
        } else if content_type == ContentType::Json && content_encoding == ContentEncoding::Identity
        {
            Bytes::from(wire.payload.into_bytes())
        } else {
            return Err(DecodeError::RawBinaryPayload);
        };

        let envelope = Self {
            source: wire.source,
            vendor: wire.vendor,
            content_type,
            content_encoding,
            payload,
        };
        validate_payload(content_type, &envelope.decompressed_payload()?)?;
        Ok(envelope)
    }

    /// Encodes the envelope as one line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, EncodeError> {
        let wire = WireLine {
            producer: PRODUCER.to_string(),
            source: self.source.clone(),
            content_type: self.content_type.as_str().to_string(),
            content_encoding: self.content_encoding.header_value().map(str::to_string),
            payload: STANDARD.encode(&self.payload),
            base64: true,
            vendor: self.vendor.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // gzip of an empty ExportTraceServiceRequest
    const EMPTY_GZIP_REQUEST: &str = "H4sIAAAAAAAAAAMAAAAAAAAAAAA=";

    fn exporter_line(source: &str, encoding: &str, payload: &str) -> String {
        serde_json::json!({
            "__otel_otlp_stdout": "otlp-stdout-span-exporter@0.2.2",
            "source": source,
            "endpoint": "http://original.collector/v1/traces",
            "method": "POST",
            "payload": payload,
            "headers": { "content-type": "application/x-protobuf" },
            "content-type": "application/x-protobuf",
            "content-encoding": encoding,
            "base64": true
        })
        .to_string()
    }

    #[test]
    fn test_parse_exporter_output_line() {
        let line = exporter_line("quotes-function", "gzip", EMPTY_GZIP_REQUEST);
        let envelope = SpanEnvelope::from_line(&line).unwrap();
        assert_eq!(envelope.source, "quotes-function");
        assert_eq!(envelope.content_type, ContentType::Protobuf);
        assert_eq!(envelope.content_encoding, ContentEncoding::Gzip);
        assert_eq!(envelope.vendor, None);
        assert!(envelope.decompressed_payload().unwrap().is_empty());
    }

    #[test]
    fn test_gzip_declared_but_plain_bytes() {
        let plain = STANDARD.encode(b"not gzip at all");
        let line = exporter_line("quotes-function", "gzip", &plain);
        let err = SpanEnvelope::from_line(&line).unwrap_err();
        assert!(matches!(err, DecodeError::Decompression(_)));
    }

    #[test]
    fn test_missing_marker_is_rejected() {
        let line = r#"{"source":"s","content-type":"application/json","payload":"{}"}"#;
        assert!(matches!(
            SpanEnvelope::from_line(line).unwrap_err(),
            DecodeError::MalformedLine(_)
        ));
    }

    #[test]
    fn test_unknown_content_type_and_encoding() {
        let line = r#"{"__otel_otlp_stdout":"x","source":"s","content-type":"text/plain","payload":"{}"}"#;
        assert!(matches!(
            SpanEnvelope::from_line(line).unwrap_err(),
            DecodeError::UnsupportedContentType(_)
        ));

        let line = r#"{"__otel_otlp_stdout":"x","source":"s","content-type":"application/json","content-encoding":"br","payload":"{}"}"#;
        assert!(matches!(
            SpanEnvelope::from_line(line).unwrap_err(),
            DecodeError::UnsupportedContentEncoding(_)
        ));
    }

    #[test]
    fn test_raw_json_payload() {
        let line = r#"{"__otel_otlp_stdout":"x","source":"s","content-type":"application/json; charset=utf-8","payload":"{\"resourceSpans\":[]}"}"#;
        let envelope = SpanEnvelope::from_line(line).unwrap();
        assert_eq!(envelope.content_type, ContentType::Json);
        assert_eq!(&envelope.payload[..], br#"{"resourceSpans":[]}"#);
    }

    #[test]
    fn test_raw_payload_not_allowed_for_protobuf() {
        let line = r#"{"__otel_otlp_stdout":"x","source":"s","content-type":"application/x-protobuf","payload":"abc"}"#;
        assert!(matches!(
            SpanEnvelope::from_line(line).unwrap_err(),
            DecodeError::RawBinaryPayload
        ));
    }

    #[test]
    fn test_line_keeps_vendor_and_payload_bytes() {
        let envelope = SpanEnvelope::new(
            "quotes-function",
            ContentType::Json,
            ContentEncoding::Gzip,
            br#"{"resourceSpans":[]}"#,
        )
        .unwrap()
        .with_vendor("honeycomb");

        let line = envelope.to_line().unwrap();
        assert!(!line.contains('\n'));
        let decoded = SpanEnvelope::from_line(&line).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.vendor_tag(), Some("honeycomb"));
    }

    #[test]
    fn test_new_rejects_invalid_payload() {
        let err = SpanEnvelope::new("s", ContentType::Json, ContentEncoding::Identity, b"nope")
            .unwrap_err();
        assert!(matches!(err, EncodeError::InvalidPayload(_)));
    }

    #[test]
    fn test_blank_vendor_is_untagged() {
        let mut envelope =
            SpanEnvelope::new("s", ContentType::Json, ContentEncoding::Identity, b"{}").unwrap();
        envelope.vendor = Some("  ".to_string());
        assert_eq!(envelope.vendor_tag(), None);
    }

    #[test]
    fn test_channel_control_line() {
        let line = ChannelMessage::invocation_complete_line();
        assert_eq!(
            ChannelMessage::parse_line(&line).unwrap(),
            ChannelMessage::InvocationComplete
        );
    }

    #[test]
    fn test_channel_envelope_line() {
        let line = exporter_line("svc", "gzip", EMPTY_GZIP_REQUEST);
        assert!(matches!(
            ChannelMessage::parse_line(&line).unwrap(),
            ChannelMessage::Envelope(_)
        ));
    }
}
