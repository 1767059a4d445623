// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host runtime API loop: fetch an invocation, handle it within its deadline,
//! post the response or the error.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::{ForwarderError, RuntimeApiError};
use crate::events::handle_event;
use crate::forwarder::ForwardingEngine;

const RUNTIME_API_VERSION: &str = "2018-06-01";
const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";
const DEADLINE_HEADER: &str = "Lambda-Runtime-Deadline-Ms";
const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

#[derive(Debug)]
pub struct Invocation {
    pub request_id: String,
    pub deadline: Instant,
    pub event: Value,
}

#[async_trait]
pub trait RuntimeApi: Send + Sync {
    async fn next_invocation(&self) -> Result<Invocation, RuntimeApiError>;

    async fn send_response(&self, request_id: &str, response: &Value)
        -> Result<(), RuntimeApiError>;

    async fn send_error(
        &self,
        request_id: &str,
        err: &ForwarderError,
    ) -> Result<(), RuntimeApiError>;
}

pub struct LambdaRuntimeClient {
    client: reqwest::Client,
    base_url: String,
}

impl LambdaRuntimeClient {
    pub fn new(runtime_api: &str) -> Result<Self, RuntimeApiError> {
        let base_url = if runtime_api.contains("://") {
            runtime_api.trim_end_matches('/').to_string()
        } else {
            format!("http://{runtime_api}")
        };
        // The next-invocation call parks until there is work, so no timeout.
        let client = reqwest::Client::builder().build()?;
        Ok(LambdaRuntimeClient { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{RUNTIME_API_VERSION}/runtime/invocation/{path}", self.base_url)
    }

    async fn post(&self, path: &str, request: reqwest::RequestBuilder) -> Result<(), RuntimeApiError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeApiError::Status { status, body });
        }
        debug!("posted invocation/{path}");
        Ok(())
    }
}

fn header<'a>(
    response: &'a reqwest::Response,
    name: &'static str,
) -> Result<&'a str, RuntimeApiError> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(RuntimeApiError::MissingHeader(name))
}

fn deadline_from_epoch_ms(deadline_ms: u64) -> Instant {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Instant::now() + Duration::from_millis(deadline_ms.saturating_sub(now_ms))
}

#[async_trait]
impl RuntimeApi for LambdaRuntimeClient {
    async fn next_invocation(&self) -> Result<Invocation, RuntimeApiError> {
        let response = self.client.get(self.url("next")).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeApiError::Status { status, body });
        }
        let request_id = header(&response, REQUEST_ID_HEADER)?.to_string();
        let deadline_ms = header(&response, DEADLINE_HEADER)?
            .parse::<u64>()
            .map_err(|_| RuntimeApiError::MissingHeader(DEADLINE_HEADER))?;
        let body = response.bytes().await?;
        Ok(Invocation {
            request_id,
            deadline: deadline_from_epoch_ms(deadline_ms),
            event: serde_json::from_slice(&body)?,
        })
    }

    async fn send_response(
        &self,
        request_id: &str,
        response: &Value,
    ) -> Result<(), RuntimeApiError> {
        let path = format!("{request_id}/response");
        let request = self.client.post(self.url(&path)).json(response);
        self.post(&path, request).await
    }

    async fn send_error(
        &self,
        request_id: &str,
        err: &ForwarderError,
    ) -> Result<(), RuntimeApiError> {
        let path = format!("{request_id}/error");
        let request = self
            .client
            .post(self.url(&path))
            .header(ERROR_TYPE_HEADER, "Unhandled")
            .json(&json!({
                "errorType": err.kind(),
                "errorMessage": err.to_string(),
            }));
        self.post(&path, request).await
    }
}

/// Handles exactly one invocation.
pub async fn run_once(
    api: &dyn RuntimeApi,
    engine: &Arc<ForwardingEngine>,
) -> Result<(), RuntimeApiError> {
    let invocation = api.next_invocation().await?;
    let started = Instant::now();
    match handle_event(engine, invocation.event, invocation.deadline).await {
        Ok(response) => {
            api.send_response(&invocation.request_id, &response).await?;
            debug!(
                "invocation {} handled in {} ms",
                invocation.request_id,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!("invocation {} failed: {e}", invocation.request_id);
            api.send_error(&invocation.request_id, &e).await?;
        }
    }
    Ok(())
}

/// Serves invocations until cancelled or the runtime API fails.
pub async fn run(
    api: Arc<dyn RuntimeApi>,
    engine: Arc<ForwardingEngine>,
    cancel: CancellationToken,
) -> Result<(), RuntimeApiError> {
    info!("waiting for invocations");
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            result = run_once(api.as_ref(), &engine) => result?,
        }
    }
}
