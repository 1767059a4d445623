// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::ConfigError;

/// Failures talking to the host extension API.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionApiError {
    #[error("extension API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("extension API answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("registration response carried no extension identifier")]
    MissingIdentifier,

    #[error("unrecognized lifecycle event: {0}")]
    UnknownEvent(String),
}

/// Errors that stop the agent from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ExtensionApi(#[from] ExtensionApiError),

    #[error("envelope source failed: {0}")]
    Source(#[from] std::io::Error),
}
