// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Republishes span envelopes polled from the ordered stream to per-vendor
//! OTLP collectors.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod credential_cache;
pub mod credentials;
pub mod delivery;
pub mod errors;
pub mod events;
pub mod forwarder;
pub mod http_utils;
pub mod poll_loop;
pub mod router;
pub mod runtime;

pub use config::{ConfigError, ForwarderConfig};
pub use credential_cache::{CredentialCache, EntryState};
pub use credentials::{ExtensionSecretStore, InMemorySecretStore, SecretStore, VendorCredential};
pub use errors::{DeliveryError, ForwarderError, RuntimeApiError, StoreError};
pub use forwarder::{BatchReport, DeliveryOutcome, ForwardingEngine, RecordOutcome};
