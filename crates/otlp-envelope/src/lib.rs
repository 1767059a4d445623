// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelope codec shared by the span capture agent and the OTLP forwarder.
//!
//! An envelope wraps one compressed, content-typed OTLP export request as a
//! single JSON line. A transport record is a newline-delimited run of those
//! lines. Decoding always decompresses and validates the payload, so a record
//! that makes it through [`frame::split_record`] carries only well-formed
//! export requests.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod compaction;
pub mod compression;
pub mod envelope;
pub mod errors;
pub mod frame;
pub mod validate;

pub use envelope::{ChannelMessage, ContentEncoding, ContentType, SpanEnvelope};
pub use errors::{DecodeError, EncodeError};
pub use frame::{split_record, RecordBuilder, MAX_RECORD_BYTES};
