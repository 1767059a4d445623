// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Checks that a decompressed payload is an export request in its declared
//! content type.

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use prost::Message;

use crate::envelope::ContentType;
use crate::errors::DecodeError;

pub fn validate_payload(content_type: ContentType, payload: &[u8]) -> Result<(), DecodeError> {
    match content_type {
        ContentType::Protobuf => decode_protobuf(payload).map(|_| ()),
        ContentType::Json => {
            serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(payload)
                .map(|_| ())
                .map_err(|e| DecodeError::InvalidPayload {
                    content_type,
                    reason: e.to_string(),
                })
        }
    }
}

pub fn decode_protobuf(payload: &[u8]) -> Result<ExportTraceServiceRequest, DecodeError> {
    ExportTraceServiceRequest::decode(payload).map_err(|e| DecodeError::InvalidPayload {
        content_type: ContentType::Protobuf,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};

    fn request_with_span(name: &str) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                scope_spans: vec![ScopeSpans {
                    spans: vec![Span {
                        name: name.to_string(),
                        trace_id: vec![1; 16],
                        span_id: vec![2; 8],
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_valid_protobuf_request() {
        let bytes = request_with_span("get_random_quote").encode_to_vec();
        assert!(validate_payload(ContentType::Protobuf, &bytes).is_ok());
        let decoded = decode_protobuf(&bytes).unwrap();
        assert_eq!(
            decoded.resource_spans[0].scope_spans[0].spans[0].name,
            "get_random_quote"
        );
    }

    #[test]
    fn test_empty_protobuf_request_is_valid() {
        assert!(validate_payload(ContentType::Protobuf, &[]).is_ok());
    }

    #[test]
    fn test_garbage_protobuf_is_rejected() {
        let err = validate_payload(ContentType::Protobuf, &[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidPayload {
                content_type: ContentType::Protobuf,
                ..
            }
        ));
    }

    #[test]
    fn test_json_must_be_an_object() {
        assert!(validate_payload(ContentType::Json, br#"{"resourceSpans":[]}"#).is_ok());
        assert!(validate_payload(ContentType::Json, b"[1,2,3]").is_err());
        assert!(validate_payload(ContentType::Json, b"{\"resourceSpans\":").is_err());
    }
}
