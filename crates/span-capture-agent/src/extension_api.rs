// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the host's extension API: registration and the long-polled
//! lifecycle event feed.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::ExtensionApiError;

const EXTENSION_API_VERSION: &str = "2020-01-01";
const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    Invoke { request_id: String, deadline: Instant },
    Shutdown { reason: String, deadline: Instant },
}

/// A host event plus the acknowledgement the agent sends once it is done
/// with it. The next event is not requested before that.
#[derive(Debug)]
pub struct HostNotice {
    pub event: HostEvent,
    pub ack: oneshot::Sender<()>,
}

#[async_trait]
pub trait ExtensionApi: Send + Sync {
    async fn register(&self, name: &str) -> Result<ExtensionId, ExtensionApiError>;

    /// Blocks until the host has the next lifecycle event for this extension.
    async fn next_event(&self, id: &ExtensionId) -> Result<HostEvent, ExtensionApiError>;
}

#[derive(Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
enum RawEvent {
    #[serde(rename_all = "camelCase")]
    Invoke { request_id: String, deadline_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Shutdown {
        #[serde(default)]
        shutdown_reason: String,
        deadline_ms: u64,
    },
}

/// Converts the host's wall-clock deadline to a monotonic instant.
pub fn deadline_from_epoch_ms(deadline_ms: u64) -> Instant {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Instant::now() + Duration::from_millis(deadline_ms.saturating_sub(now_ms))
}

pub struct LambdaExtensionClient {
    client: reqwest::Client,
    base_url: String,
}

impl LambdaExtensionClient {
    /// `runtime_api` is the `host:port` the host exposes to extensions.
    pub fn new(runtime_api: &str) -> Result<Self, ExtensionApiError> {
        let base_url = if runtime_api.starts_with("http://") || runtime_api.starts_with("https://") {
            runtime_api.trim_end_matches('/').to_string()
        } else {
            format!("http://{runtime_api}")
        };
        // No request timeout: the event call parks until the next invocation.
        let client = reqwest::Client::builder().build()?;
        Ok(LambdaExtensionClient { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{EXTENSION_API_VERSION}/extension/{path}", self.base_url)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ExtensionApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ExtensionApiError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ExtensionApi for LambdaExtensionClient {
    async fn register(&self, name: &str) -> Result<ExtensionId, ExtensionApiError> {
        let response = self
            .client
            .post(self.url("register"))
            .header(EXTENSION_NAME_HEADER, name)
            .json(&serde_json::json!({ "events": ["INVOKE", "SHUTDOWN"] }))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ExtensionApiError::MissingIdentifier)?;
        debug!("registered extension {name} as {id}");
        Ok(ExtensionId(id.to_string()))
    }

    async fn next_event(&self, id: &ExtensionId) -> Result<HostEvent, ExtensionApiError> {
        let response = self
            .client
            .get(self.url("event/next"))
            .header(EXTENSION_ID_HEADER, &id.0)
            .send()
            .await?;
        let body = ensure_success(response).await?.text().await?;
        let event = match serde_json::from_str::<RawEvent>(&body) {
            Ok(RawEvent::Invoke {
                request_id,
                deadline_ms,
            }) => HostEvent::Invoke {
                request_id,
                deadline: deadline_from_epoch_ms(deadline_ms),
            },
            Ok(RawEvent::Shutdown {
                shutdown_reason,
                deadline_ms,
            }) => HostEvent::Shutdown {
                reason: shutdown_reason,
                deadline: deadline_from_epoch_ms(deadline_ms),
            },
            Err(_) => return Err(ExtensionApiError::UnknownEvent(body)),
        };
        Ok(event)
    }
}

/// Feeds host events to the agent one at a time, asking for the next event
/// only after the agent acknowledged the previous one. Ends after SHUTDOWN,
/// on cancellation, or on an API failure, which closes the channel.
pub async fn pump_events(
    api: Arc<dyn ExtensionApi>,
    id: ExtensionId,
    tx: mpsc::Sender<HostNotice>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = api.next_event(&id) => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                error!("failed to fetch the next lifecycle event: {e}");
                return;
            }
        };
        let shutdown = matches!(event, HostEvent::Shutdown { .. });
        let (ack, acked) = oneshot::channel();
        if tx.send(HostNotice { event, ack }).await.is_err() {
            return;
        }
        let _ = acked.await;
        if shutdown {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn epoch_ms_in(offset: Duration) -> u64 {
        (SystemTime::now() + offset)
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    #[tokio::test]
    async fn test_register_reads_identifier() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/2020-01-01/extension/register")
            .match_header("Lambda-Extension-Name", "span-capture-agent")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({ "events": ["INVOKE", "SHUTDOWN"] }),
            ))
            .with_status(200)
            .with_header("Lambda-Extension-Identifier", "ext-123")
            .with_body("{}")
            .create_async()
            .await;

        let client = LambdaExtensionClient::new(&server.url()).unwrap();
        let id = client.register("span-capture-agent").await.unwrap();

        mock.assert_async().await;
        assert_eq!(id, ExtensionId("ext-123".to_string()));
    }

    #[tokio::test]
    async fn test_register_failure_surfaces_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/2020-01-01/extension/register")
            .with_status(403)
            .with_body("denied")
            .create_async()
            .await;

        let client = LambdaExtensionClient::new(&server.url()).unwrap();
        let err = client.register("span-capture-agent").await.unwrap_err();
        assert!(matches!(err, ExtensionApiError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_next_event_parses_invoke_and_shutdown() {
        let mut server = Server::new_async().await;
        let deadline_ms = epoch_ms_in(Duration::from_secs(3));
        let invoke = server
            .mock("GET", "/2020-01-01/extension/event/next")
            .match_header("Lambda-Extension-Identifier", "ext-123")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "eventType": "INVOKE",
                    "requestId": "req-1",
                    "deadlineMs": deadline_ms,
                    "invokedFunctionArn": "arn:aws:lambda:eu-west-1:123:function:checkout"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = LambdaExtensionClient::new(&server.url()).unwrap();
        let id = ExtensionId("ext-123".to_string());
        let before = Instant::now();
        match client.next_event(&id).await.unwrap() {
            HostEvent::Invoke {
                request_id,
                deadline,
            } => {
                assert_eq!(request_id, "req-1");
                assert!(deadline > before);
                assert!(deadline <= Instant::now() + Duration::from_secs(3));
            }
            other => panic!("unexpected event {other:?}"),
        }
        invoke.remove_async().await;

        let _shutdown = server
            .mock("GET", "/2020-01-01/extension/event/next")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "eventType": "SHUTDOWN",
                    "shutdownReason": "spindown",
                    "deadlineMs": deadline_ms
                })
                .to_string(),
            )
            .create_async()
            .await;
        assert!(matches!(
            client.next_event(&id).await.unwrap(),
            HostEvent::Shutdown { reason, .. } if reason == "spindown"
        ));
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_an_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/2020-01-01/extension/event/next")
            .with_status(200)
            .with_body(r#"{"eventType":"RESTORE","deadlineMs":1}"#)
            .create_async()
            .await;

        let client = LambdaExtensionClient::new(&server.url()).unwrap();
        let err = client
            .next_event(&ExtensionId("ext".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionApiError::UnknownEvent(_)));
    }

    #[test]
    fn test_past_deadline_maps_to_now() {
        let before = Instant::now();
        let deadline = deadline_from_epoch_ms(0);
        assert!(deadline >= before);
        assert!(deadline <= Instant::now());
    }

    struct ScriptedApi {
        events: Mutex<VecDeque<HostEvent>>,
    }

    #[async_trait]
    impl ExtensionApi for ScriptedApi {
        async fn register(&self, _name: &str) -> Result<ExtensionId, ExtensionApiError> {
            Ok(ExtensionId("scripted".to_string()))
        }

        async fn next_event(&self, _id: &ExtensionId) -> Result<HostEvent, ExtensionApiError> {
            let next = self.events.lock().unwrap().pop_front();
            match next {
                Some(event) => Ok(event),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_pump_waits_for_ack_and_stops_after_shutdown() {
        let deadline = Instant::now() + Duration::from_secs(2);
        let api = Arc::new(ScriptedApi {
            events: Mutex::new(VecDeque::from([
                HostEvent::Invoke {
                    request_id: "req-1".to_string(),
                    deadline,
                },
                HostEvent::Shutdown {
                    reason: "spindown".to_string(),
                    deadline,
                },
            ])),
        });
        let (tx, mut rx) = mpsc::channel(1);
        let pump = tokio::spawn(pump_events(
            api.clone(),
            ExtensionId("scripted".to_string()),
            tx,
            CancellationToken::new(),
        ));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, HostEvent::Invoke { .. }));
        // Nothing else is requested before the acknowledgement.
        tokio::task::yield_now().await;
        assert_eq!(api.events.lock().unwrap().len(), 1);
        first.ack.send(()).unwrap();

        let second = rx.recv().await.unwrap();
        assert!(matches!(second.event, HostEvent::Shutdown { .. }));
        second.ack.send(()).unwrap();

        pump.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
