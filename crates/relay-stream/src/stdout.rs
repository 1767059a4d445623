// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{SequenceToken, StreamRecord, StreamTransport, TransportError};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StdoutRecord<'a> {
    partition_key: &'a str,
    sequence_number: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StdoutRecordLine {
    partition_key: String,
    sequence_number: String,
    data: String,
}

/// Reads back a line written by [`StdoutTransport`]. Returns `None` for any
/// other log line.
pub fn parse_record_line(line: &str) -> Option<StreamRecord> {
    let line: StdoutRecordLine = serde_json::from_str(line.trim()).ok()?;
    let data = base64::engine::general_purpose::STANDARD
        .decode(line.data.as_bytes())
        .ok()?;
    Some(StreamRecord {
        record_id: line.sequence_number,
        partition_key: line.partition_key,
        data: Bytes::from(data),
    })
}

/// Appends each record as one JSON line on a writer, stdout by default, for
/// hosts where the platform log service is the durable stream.
pub struct StdoutTransport<W = tokio::io::Stdout> {
    writer: Mutex<W>,
    sequence: AtomicU64,
}

impl StdoutTransport<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> StdoutTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        StdoutTransport {
            writer: Mutex::new(writer),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> StreamTransport for StdoutTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn append(
        &self,
        partition_key: &str,
        data: Bytes,
    ) -> Result<SequenceToken, TransportError> {
        let sequence_number = format!("{:020}", self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        let record = StdoutRecord {
            partition_key,
            sequence_number: sequence_number.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&data),
        };
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(SequenceToken(sequence_number))
    }
}
