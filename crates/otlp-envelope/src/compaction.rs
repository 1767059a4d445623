// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span compaction: merges protobuf export requests bound for the same vendor
//! so they go out in one collector call.

use std::collections::HashMap;

use bytes::Bytes;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use prost::Message;
use tracing::debug;

use crate::compression::gzip;
use crate::envelope::{ContentEncoding, ContentType, SpanEnvelope};
use crate::errors::EncodeError;
use crate::validate::decode_protobuf;

enum Slot {
    Ready(SpanEnvelope),
    Merging {
        first: SpanEnvelope,
        request: Option<ExportTraceServiceRequest>,
        merged: usize,
    },
}

/// Merges every protobuf envelope sharing a vendor tag into a single
/// gzip-compressed envelope, placed where the first of them was. JSON
/// envelopes and lone protobuf envelopes pass through untouched.
pub fn compact(envelopes: Vec<SpanEnvelope>) -> Result<Vec<SpanEnvelope>, EncodeError> {
    let input_len = envelopes.len();
    let mut slots: Vec<Slot> = Vec::with_capacity(input_len);
    let mut merge_slot: HashMap<Option<String>, usize> = HashMap::new();

    for envelope in envelopes {
        if envelope.content_type != ContentType::Protobuf {
            slots.push(Slot::Ready(envelope));
            continue;
        }
        let key = envelope.vendor_tag().map(str::to_string);
        let Some(&idx) = merge_slot.get(&key) else {
            merge_slot.insert(key, slots.len());
            slots.push(Slot::Merging {
                first: envelope,
                request: None,
                merged: 1,
            });
            continue;
        };
        let incoming = decode_protobuf(&envelope.decompressed_payload()?)?;
        if let Slot::Merging {
            first,
            request,
            merged,
        } = &mut slots[idx]
        {
            if request.is_none() {
                *request = Some(decode_protobuf(&first.decompressed_payload()?)?);
            }
            if let Some(acc) = request.as_mut() {
                acc.resource_spans.extend(incoming.resource_spans);
                *merged += 1;
            }
        }
    }

    let mut out = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Slot::Ready(envelope)
            | Slot::Merging {
                first: envelope,
                request: None,
                ..
            } => out.push(envelope),
            Slot::Merging {
                first,
                request: Some(request),
                merged,
            } => {
                debug!("Compacted {merged} protobuf payloads from {}", first.source);
                out.push(SpanEnvelope {
                    source: first.source,
                    vendor: first.vendor,
                    content_type: ContentType::Protobuf,
                    content_encoding: ContentEncoding::Gzip,
                    payload: Bytes::from(gzip(&request.encode_to_vec())?),
                });
            }
        }
    }
    debug!("Compaction reduced {input_len} envelopes to {}", out.len());
    Ok(out)
}
