// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Invocation events that carry a polled batch, and their responses.
//!
//! Two carriers are understood: ordered-stream events, which support
//! reporting individual record failures back to the host, and
//! log-subscription events, which do not. For the latter any record needing
//! redelivery fails the whole invocation.

use std::sync::Arc;

use base64::prelude::*;
use bytes::Bytes;
use otlp_envelope::compression::gunzip;
use relay_stream::{parse_record_line, StreamRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::errors::ForwarderError;
use crate::forwarder::{BatchReport, DeliveryOutcome, ForwardingEngine, RecordOutcome};

const ENVELOPE_MARKER: &str = "__otel_otlp_stdout";
const CONTROL_MESSAGE: &str = "CONTROL_MESSAGE";

#[derive(Debug, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "Records")]
    pub records: Vec<StreamEventRecord>,
}

#[derive(Debug, Deserialize)]
pub struct StreamEventRecord {
    pub kinesis: StreamEventData,
    #[serde(rename = "eventSourceARN", default)]
    pub event_source_arn: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEventData {
    pub partition_key: String,
    pub sequence_number: String,
    pub data: String,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailures {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsEvent {
    pub awslogs: LogsEventData,
}

/// Base64 of the gzip-compressed [`LogsBatch`] document.
#[derive(Debug, Deserialize)]
pub struct LogsEventData {
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsBatch {
    pub message_type: String,
    #[serde(default)]
    pub log_group: String,
    #[serde(default)]
    pub log_stream: String,
    #[serde(default)]
    pub log_events: Vec<LogEvent>,
}

#[derive(Debug, Deserialize)]
pub struct LogEvent {
    pub id: String,
    pub message: String,
}

#[derive(Debug)]
pub enum InvocationEvent {
    Stream(StreamEvent),
    Logs(LogsEvent),
}

impl InvocationEvent {
    pub fn parse(event: Value) -> Result<Self, ForwarderError> {
        if event.get("Records").is_some() {
            return serde_json::from_value(event)
                .map(Self::Stream)
                .map_err(|e| ForwarderError::InvalidEvent(e.to_string()));
        }
        if event.get("awslogs").is_some() {
            return serde_json::from_value(event)
                .map(Self::Logs)
                .map_err(|e| ForwarderError::InvalidEvent(e.to_string()));
        }
        Err(ForwarderError::InvalidEvent(
            "neither a stream nor a log subscription event".to_string(),
        ))
    }
}

impl LogsEventData {
    pub fn decode(&self) -> Result<LogsBatch, ForwarderError> {
        let compressed = BASE64_STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ForwarderError::InvalidEvent(format!("awslogs.data: {e}")))?;
        let raw = gunzip(&compressed)?;
        serde_json::from_slice(&raw)
            .map_err(|e| ForwarderError::InvalidEvent(format!("awslogs.data: {e}")))
    }
}

/// Handles one invocation event and builds the response for the host.
pub async fn handle_event(
    engine: &Arc<ForwardingEngine>,
    event: Value,
    deadline: Instant,
) -> Result<Value, ForwarderError> {
    match InvocationEvent::parse(event)? {
        InvocationEvent::Stream(event) => {
            let response = handle_stream_event(engine, event, deadline).await;
            serde_json::to_value(response).map_err(|e| ForwarderError::TransientIo(e.to_string()))
        }
        InvocationEvent::Logs(event) => {
            handle_logs_event(engine, event, deadline).await?;
            Ok(Value::Null)
        }
    }
}

/// Stream name out of an ARN like `arn:aws:kinesis:region:account:stream/name`.
fn stream_name(arn: &str) -> Option<&str> {
    arn.split(':').nth(5)?.split('/').nth(1)
}

pub async fn handle_stream_event(
    engine: &Arc<ForwardingEngine>,
    event: StreamEvent,
    deadline: Instant,
) -> BatchItemFailures {
    let stream = event
        .records
        .first()
        .and_then(|r| r.event_source_arn.as_deref())
        .and_then(stream_name)
        .unwrap_or("unknown");
    let span = info_span!(
        "stream_event_processor",
        faas.trigger.type = "stream",
        records = event.records.len(),
        stream = %stream
    );
    process_stream_event(engine, event, deadline)
        .instrument(span)
        .await
}

async fn process_stream_event(
    engine: &Arc<ForwardingEngine>,
    event: StreamEvent,
    deadline: Instant,
) -> BatchItemFailures {
    let mut records = Vec::with_capacity(event.records.len());
    let mut undecodable = Vec::new();
    for record in event.records {
        let data = record.kinesis;
        match BASE64_STANDARD.decode(data.data.as_bytes()) {
            Ok(bytes) => records.push(StreamRecord {
                record_id: data.sequence_number,
                partition_key: data.partition_key,
                data: Bytes::from(bytes),
            }),
            Err(e) => {
                warn!(record_id = %data.sequence_number, "dropping record with invalid base64 data: {e}");
                undecodable.push(RecordOutcome {
                    record_id: data.sequence_number,
                    partition_key: data.partition_key,
                    outcome: DeliveryOutcome::Dropped(e.to_string()),
                });
            }
        }
    }

    let mut report = engine.process_batch(records, deadline).await;
    report.outcomes.extend(undecodable);
    info!("stream batch done: {report}");

    BatchItemFailures {
        batch_item_failures: report
            .retry_ids()
            .into_iter()
            .map(|item_identifier| BatchItemFailure { item_identifier })
            .collect(),
    }
}

/// Delivers the envelopes of a log-subscription batch. Fails when any of them
/// needs redelivery, since the host can only retry the batch as a whole.
pub async fn handle_logs_event(
    engine: &Arc<ForwardingEngine>,
    event: LogsEvent,
    deadline: Instant,
) -> Result<BatchReport, ForwarderError> {
    let batch = event.awslogs.decode()?;
    let span = info_span!(
        "logs_event_processor",
        faas.trigger.type = "logs",
        records = batch.log_events.len(),
        log_group = %batch.log_group
    );
    process_logs_batch(engine, batch, deadline)
        .instrument(span)
        .await
}

async fn process_logs_batch(
    engine: &Arc<ForwardingEngine>,
    batch: LogsBatch,
    deadline: Instant,
) -> Result<BatchReport, ForwarderError> {
    if batch.message_type == CONTROL_MESSAGE {
        debug!("ignoring log subscription control message");
        return Ok(BatchReport::default());
    }

    let mut records = Vec::with_capacity(batch.log_events.len());
    for log_event in batch.log_events {
        if let Some(record) = parse_record_line(&log_event.message) {
            records.push(record);
        } else if log_event.message.contains(ENVELOPE_MARKER) {
            records.push(StreamRecord {
                record_id: log_event.id,
                partition_key: batch.log_stream.clone(),
                data: Bytes::from(log_event.message),
            });
        } else {
            debug!("skipping log event {} without envelope", log_event.id);
        }
    }

    let report = engine.process_batch(records, deadline).await;
    info!("log batch from {} done: {report}", batch.log_group);
    match report.retryable() {
        0 => Ok(report),
        n => Err(ForwarderError::TransientIo(format!(
            "{n} records need redelivery"
        ))),
    }
}
