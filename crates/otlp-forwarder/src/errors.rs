// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use otlp_envelope::DecodeError;
use reqwest::StatusCode;

use crate::config::ConfigError;

/// Failure classes of the forwarding path. Each class has one handling
/// policy: transient and budget failures are retried by redelivery, auth
/// failures invalidate the credential, decode failures drop the record,
/// configuration failures stop the process.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("credential for vendor {vendor} rejected")]
    Auth { vendor: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("execution budget exhausted")]
    BudgetExceeded,

    #[error("unrecognised invocation event: {0}")]
    InvalidEvent(String),
}

impl ForwarderError {
    /// Short class name reported to the host as the error type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "TransientIo",
            Self::Auth { .. } => "Auth",
            Self::Decode(_) => "Decode",
            Self::Config(_) => "Config",
            Self::BudgetExceeded => "BudgetExceeded",
            Self::InvalidEvent(_) => "InvalidEvent",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::Auth { .. } | Self::BudgetExceeded
        )
    }
}

/// Failures talking to the host runtime API. All of them end the process;
/// the host restarts it.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeApiError {
    #[error("runtime API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("runtime API answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("runtime API response lacks the {0} header")]
    MissingHeader(&'static str),

    #[error("invocation event is not JSON: {0}")]
    Event(#[from] serde_json::Error),
}

/// Failures of the credential store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),

    #[error("no credential stored under {0}")]
    NotFound(String),

    #[error("credential {key} is malformed: {reason}")]
    Malformed { key: String, reason: String },
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Failures of one outbound collector request.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("collector answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("collector unreachable: {0}")]
    Network(#[from] reqwest::Error),

    #[error("collector request timed out")]
    Timeout,

    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
}

impl DeliveryError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Status { status, .. }
            if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN)
    }

    /// Whether the same request may succeed later. 408, 429 and 5xx answers
    /// and connection failures qualify; other 4xx answers never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error()
            }
            Self::Network(_) | Self::Timeout => true,
            Self::InvalidEndpoint(_) => false,
        }
    }
}
