// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spans travelling the whole relay: capture agent, stream, forwarder,
//! collector.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use mockito::{Matcher, Server};
use otlp_envelope::compression::gzip;
use otlp_envelope::{ChannelMessage, ContentEncoding, ContentType, SpanEnvelope};
use otlp_forwarder::events::handle_event;
use otlp_forwarder::poll_loop::{poll_once, PollSettings};
use otlp_forwarder::{ForwarderConfig, ForwardingEngine, InMemorySecretStore};
use relay_stream::{MemoryStream, StdoutTransport, StreamTransport};
use serde_json::json;
use span_capture_agent::diagnostics::Diagnostics;
use span_capture_agent::{AgentConfig, CaptureAgent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn envelope(n: usize) -> SpanEnvelope {
    let payload = format!(r#"{{"resourceSpans":[],"n":{n}}}"#);
    SpanEnvelope::new("checkout", ContentType::Json, ContentEncoding::Gzip, payload.as_bytes())
        .unwrap()
}

fn engine(collector_url: &str) -> Arc<ForwardingEngine> {
    let store = InMemorySecretStore::new();
    store.insert("default", collector_url, "x-api-key=relay");
    let config = ForwarderConfig {
        compact: false,
        ..Default::default()
    };
    Arc::new(ForwardingEngine::from_config(&config, Arc::new(store)).unwrap())
}

/// Runs a capture agent over `transport`, feeds it `count` envelopes, then
/// cancels it so the open batch is flushed.
async fn capture(transport: Arc<dyn StreamTransport>, count: usize) {
    let config = AgentConfig {
        partition_key: "checkout".to_string(),
        ..Default::default()
    };
    let agent = CaptureAgent::new(&config, transport, Arc::new(Diagnostics::default()));
    let (messages, message_rx) = mpsc::channel(16);
    let (_notices, notice_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(agent.run(message_rx, notice_rx, cancel.clone()));

    for n in 0..count {
        messages
            .send(ChannelMessage::Envelope(envelope(n)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let snapshot = task.await.unwrap();
    assert_eq!(snapshot.envelopes_received, count as u64);
}

#[tokio::test]
async fn test_spans_reach_the_collector_byte_for_byte() {
    let mut server = Server::new_async().await;
    let mut mocks = Vec::new();
    for n in 0..3 {
        mocks.push(
            server
                .mock("POST", "/v1/traces")
                .match_header("x-api-key", "relay")
                .match_header("content-encoding", "gzip")
                .match_body(Matcher::from(envelope(n).payload.to_vec()))
                .with_status(200)
                .expect(1)
                .create_async()
                .await,
        );
    }

    let stream = MemoryStream::default();
    capture(Arc::new(stream.clone()), 3).await;
    assert_eq!(stream.pending("checkout").len(), 1);

    let report = poll_once(
        &stream,
        &engine(&server.url()),
        PollSettings {
            max_records: 10,
            max_wait: Duration::from_millis(10),
            budget: Duration::from_secs(10),
        },
    )
    .await
    .unwrap();

    for mock in mocks {
        mock.assert_async().await;
    }
    assert_eq!(report.delivered(), 1);
    assert!(stream.all_pending().is_empty());
}

#[tokio::test]
async fn test_stdout_records_forwarded_from_log_subscription() {
    let mut server = Server::new_async().await;
    let collector = server
        .mock("POST", "/v1/traces")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let stdout = Arc::new(StdoutTransport::new(Vec::new()));
    capture(stdout.clone(), 2).await;
    let written = match Arc::try_unwrap(stdout) {
        Ok(transport) => String::from_utf8(transport.into_inner()).unwrap(),
        Err(_) => panic!("agent still holds the transport"),
    };

    let log_events: Vec<_> = written
        .lines()
        .enumerate()
        .map(|(i, line)| json!({"id": i.to_string(), "timestamp": 0, "message": line}))
        .collect();
    let document = json!({
        "messageType": "DATA_MESSAGE",
        "logGroup": "/aws/lambda/checkout",
        "logStream": "stream",
        "logEvents": log_events,
    });
    let event = json!({"awslogs": {
        "data": BASE64_STANDARD.encode(gzip(document.to_string().as_bytes()).unwrap()),
    }});

    let response = handle_event(
        &engine(&server.url()),
        event,
        Instant::now() + Duration::from_secs(10),
    )
    .await
    .unwrap();

    collector.assert_async().await;
    assert_eq!(response, serde_json::Value::Null);
}
