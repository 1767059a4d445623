// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use otlp_forwarder::http_utils::build_client;
use otlp_forwarder::runtime::{self, LambdaRuntimeClient};
use otlp_forwarder::{ExtensionSecretStore, ForwarderConfig, ForwardingEngine};
use serverless_otlp_relay::logger;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
pub async fn main() -> ExitCode {
    if let Err(e) = logger::init() {
        eprintln!("otlp-forwarder: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = match ForwarderConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Refusing to start with invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let runtime_api = match config.require_runtime_api() {
        Ok(addr) => addr.to_string(),
        Err(e) => {
            error!("Refusing to start with invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let client = match build_client(config.https_proxy.as_deref(), config.request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to build the secrets client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let store = ExtensionSecretStore::new(
        client,
        &config.secrets_endpoint,
        &config.secrets_prefix,
        env::var("AWS_SESSION_TOKEN").ok(),
    );
    let engine = match ForwardingEngine::from_config(&config, Arc::new(store)) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("Unable to build the forwarding engine: {e}");
            return ExitCode::FAILURE;
        }
    };
    let api = match LambdaRuntimeClient::new(&runtime_api) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("Cannot reach the runtime API: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    info!(
        "forwarding to default vendor {} with up to {} concurrent deliveries",
        config.default_vendor, config.max_concurrency
    );
    match runtime::run(api, engine, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("runtime loop stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
