// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture agent: a sidecar that drains span envelopes written by the
//! function's exporter, batches them, and appends each batch to the ordered
//! stream on count, time, and lifecycle triggers.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod batch;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod extension_api;
pub mod flusher;
pub mod lifecycle;
pub mod source;

pub use agent::{start, CaptureAgent};
pub use config::{AgentConfig, OutputType, ProcessorMode};
pub use errors::AgentError;
