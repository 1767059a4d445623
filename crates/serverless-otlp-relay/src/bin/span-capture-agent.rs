// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use relay_stream::{StdoutTransport, StreamTransport};
use serverless_otlp_relay::logger;
use span_capture_agent::extension_api::LambdaExtensionClient;
use span_capture_agent::source::EnvelopeReader;
use span_capture_agent::{start, AgentConfig, OutputType};
use tracing::{debug, error, info, warn};

// Must match the file name the host finds the extension under.
const EXTENSION_NAME: &str = "span-capture-agent";

#[tokio::main]
pub async fn main() -> ExitCode {
    if let Err(e) = logger::init() {
        eprintln!("span-capture-agent: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Refusing to start with invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let api = match config
        .require_runtime_api()
        .map_err(|e| e.to_string())
        .and_then(|addr| LambdaExtensionClient::new(addr).map_err(|e| e.to_string()))
    {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("Cannot reach the extension API: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (reader, direct) = EnvelopeReader::from_config(&config);
    match config.output_type {
        OutputType::Stdout => {
            info!("exporter writes envelopes to stdout, only following the lifecycle")
        }
        OutputType::Direct if direct.is_some() => {
            warn!("direct output needs an in-process exporter, no envelopes will arrive")
        }
        _ => {}
    }
    drop(direct);

    let transport: Arc<dyn StreamTransport> = Arc::new(StdoutTransport::stdout());
    match start(&config, EXTENSION_NAME, api, reader, transport).await {
        Ok(snapshot) => {
            info!("span capture agent stopped: {snapshot}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("span capture agent failed: {e}");
            ExitCode::FAILURE
        }
    }
}
