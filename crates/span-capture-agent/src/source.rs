// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Readers for the local channel the function's exporter writes envelopes to.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use otlp_envelope::ChannelMessage;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, OutputType};
use crate::diagnostics::Diagnostics;

/// Capacity of the channel between the exporter and the direct reader.
pub const DIRECT_CHANNEL_CAPACITY: usize = 1024;

pub enum EnvelopeReader {
    /// Named pipe; created when missing.
    Pipe(PathBuf),

    /// Lines handed over in-process.
    Direct(mpsc::Receiver<String>),

    /// Nothing to read: envelopes leave through the function's own stdout.
    Disabled,

    /// Replays a fixed set of lines, then ends.
    #[allow(dead_code)]
    MirrorTest(Vec<String>),
}

impl EnvelopeReader {
    /// Builds the reader for the configured output type. `Direct` also returns
    /// the sender the exporter writes lines into.
    pub fn from_config(config: &AgentConfig) -> (Self, Option<mpsc::Sender<String>>) {
        match config.output_type {
            OutputType::Pipe => (Self::Pipe(config.pipe_path.clone()), None),
            OutputType::Direct => {
                let (tx, rx) = mpsc::channel(DIRECT_CHANNEL_CAPACITY);
                (Self::Direct(rx), Some(tx))
            }
            OutputType::Stdout => (Self::Disabled, None),
        }
    }

    /// Forwards parsed channel messages to `tx` until cancelled, the source
    /// ends, or the agent stops listening. Lines that do not parse are
    /// counted and skipped.
    pub async fn run(
        self,
        tx: mpsc::Sender<ChannelMessage>,
        diagnostics: Arc<Diagnostics>,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        let forwarder = LineForwarder {
            tx,
            diagnostics,
            cancel,
        };
        match self {
            EnvelopeReader::Pipe(path) => {
                ensure_fifo(&path)?;
                info!("reading envelopes from {}", path.display());
                loop {
                    let pipe = open_fifo(&path)?;
                    if !forwarder.forward_lines(BufReader::new(pipe)).await? {
                        return Ok(());
                    }
                    debug!("all writers closed {}, reopening", path.display());
                }
            }
            EnvelopeReader::Direct(mut rx) => {
                loop {
                    let line = tokio::select! {
                        () = forwarder.cancel.cancelled() => return Ok(()),
                        line = rx.recv() => line,
                    };
                    match line {
                        Some(line) => {
                            if !forwarder.forward(&line).await {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
            EnvelopeReader::Disabled => {
                info!("exporter writes to stdout, no local channel to drain");
                forwarder.cancel.cancelled().await;
                Ok(())
            }
            EnvelopeReader::MirrorTest(lines) => {
                for line in lines {
                    if !forwarder.forward(&line).await {
                        break;
                    }
                }
                Ok(())
            }
        }
    }
}

struct LineForwarder {
    tx: mpsc::Sender<ChannelMessage>,
    diagnostics: Arc<Diagnostics>,
    cancel: CancellationToken,
}

impl LineForwarder {
    /// Returns `Ok(true)` when the reader hit end of input and may be reopened.
    async fn forward_lines<R>(&self, reader: R) -> io::Result<bool>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            let line = tokio::select! {
                () = self.cancel.cancelled() => return Ok(false),
                line = lines.next_line() => line?,
            };
            match line {
                Some(line) => {
                    if !self.forward(&line).await {
                        return Ok(false);
                    }
                }
                None => return Ok(true),
            }
        }
    }

    /// Returns false once the agent side has gone away.
    async fn forward(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }
        match ChannelMessage::parse_line(line) {
            Ok(message) => self.tx.send(message).await.is_ok(),
            Err(e) => {
                self.diagnostics.decode_error();
                warn!("discarding line from exporter: {e}");
                true
            }
        }
    }
}

#[cfg(unix)]
fn ensure_fifo(path: &std::path::Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a named pipe", path.display()),
            ))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn open_fifo(path: &std::path::Path) -> io::Result<tokio::net::unix::pipe::Receiver> {
    let mut options = tokio::net::unix::pipe::OpenOptions::new();
    // Holding a write end ourselves keeps the pipe from reporting end of
    // input between invocations.
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options.open_receiver(path)
}

#[cfg(not(unix))]
fn ensure_fifo(_path: &std::path::Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are only supported on unix",
    ))
}

#[cfg(not(unix))]
fn open_fifo(_path: &std::path::Path) -> io::Result<tokio::fs::File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are only supported on unix",
    ))
}
