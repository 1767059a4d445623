// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use otlp_envelope::{ChannelMessage, SpanEnvelope};
use relay_stream::StreamTransport;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batcher, FlushTrigger, Rejected};
use crate::config::AgentConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::errors::AgentError;
use crate::extension_api::{pump_events, ExtensionApi, HostEvent, HostNotice};
use crate::flusher::Flusher;
use crate::lifecycle::{Directive, Lifecycle, LifecycleEvent};
use crate::source::EnvelopeReader;

/// Time kept back from an invocation deadline for the flush of a held batch.
pub const FLUSH_RESERVE: Duration = Duration::from_millis(200);

/// Drain budget when the agent is stopped without a host deadline.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Retry budget of a flush that no held invocation bounds.
pub const FLUSH_BUDGET: Duration = Duration::from_secs(2);

const MESSAGE_CHANNEL_CAPACITY: usize = 1024;
const NOTICE_CHANNEL_CAPACITY: usize = 1;

/// An invocation the host is waiting on.
struct Held {
    ack: oneshot::Sender<()>,
    until: Instant,
    deadline: Instant,
}

enum Step {
    Continue,
    Exit,
}

/// Process-scoped root of the agent: owns the open batch and decides when it
/// is flushed. Everything runs on one task, so flushes never overlap.
pub struct CaptureAgent {
    lifecycle: Lifecycle,
    batcher: Batcher,
    flusher: Flusher,
    diagnostics: Arc<Diagnostics>,
    held: Option<Held>,
}

impl CaptureAgent {
    pub fn new(
        config: &AgentConfig,
        transport: Arc<dyn StreamTransport>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        CaptureAgent {
            lifecycle: Lifecycle::new(config.mode),
            batcher: Batcher::new(config.max_records, config.max_wait, config.max_record_bytes),
            flusher: Flusher::new(
                transport,
                config.partition_key.clone(),
                config.append_max_attempts,
                config.append_backoff,
                diagnostics.clone(),
            ),
            diagnostics,
            held: None,
        }
    }

    /// Runs until SHUTDOWN has been drained, the lifecycle feed closes, or
    /// `cancel` fires. Assumes registration already happened.
    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<ChannelMessage>,
        mut notices: mpsc::Receiver<HostNotice>,
        cancel: CancellationToken,
    ) -> DiagnosticsSnapshot {
        self.lifecycle.on(LifecycleEvent::Registered);
        let mut messages_open = true;

        loop {
            let window = self.batcher.deadline();
            let hold = self.held.as_ref().map(|h| h.until);

            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("capture agent cancelled, draining");
                    self.drain(&mut messages, Instant::now() + DEFAULT_SHUTDOWN_GRACE).await;
                    Step::Exit
                }
                notice = notices.recv() => match notice {
                    Some(notice) => self.on_notice(notice, &mut messages).await,
                    None => {
                        warn!("lifecycle feed closed, draining");
                        self.drain(&mut messages, Instant::now() + DEFAULT_SHUTDOWN_GRACE).await;
                        Step::Exit
                    }
                },
                message = messages.recv(), if messages_open => {
                    match message {
                        Some(message) => self.on_message(message).await,
                        None => {
                            debug!("envelope source ended");
                            messages_open = false;
                        }
                    }
                    Step::Continue
                }
                () = tokio::time::sleep_until(window.unwrap_or_else(Instant::now)), if window.is_some() => {
                    self.flush_open(FlushTrigger::MaxWait).await;
                    Step::Continue
                }
                () = tokio::time::sleep_until(hold.unwrap_or_else(Instant::now)), if hold.is_some() => {
                    debug!("invocation-complete marker did not arrive in time");
                    let directive = self.lifecycle.on(LifecycleEvent::HoldExpired);
                    self.apply(directive).await;
                    Step::Continue
                }
            };

            if let Step::Exit = step {
                break;
            }
        }

        let snapshot = self.diagnostics.snapshot();
        info!("capture agent stopped: {snapshot}");
        snapshot
    }

    async fn on_notice(
        &mut self,
        notice: HostNotice,
        messages: &mut mpsc::Receiver<ChannelMessage>,
    ) -> Step {
        match notice.event {
            HostEvent::Invoke {
                request_id,
                deadline,
            } => {
                debug!("invocation {request_id} started");
                match self.lifecycle.on(LifecycleEvent::Invoke { deadline }) {
                    Directive::Hold { until } => {
                        let now = Instant::now();
                        let until = until.checked_sub(FLUSH_RESERVE).unwrap_or(now).max(now);
                        self.held = Some(Held {
                            ack: notice.ack,
                            until,
                            deadline,
                        });
                    }
                    _ => {
                        let _ = notice.ack.send(());
                    }
                }
                Step::Continue
            }
            HostEvent::Shutdown { reason, deadline } => {
                info!("shutdown requested ({reason}), draining");
                if let Directive::DrainAndExit { deadline } =
                    self.lifecycle.on(LifecycleEvent::Shutdown { deadline })
                {
                    self.drain(messages, deadline).await;
                }
                let _ = notice.ack.send(());
                Step::Exit
            }
        }
    }

    async fn on_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::Envelope(envelope) => {
                let deadline = self.flush_deadline();
                self.accept(&envelope, deadline).await;
            }
            ChannelMessage::InvocationComplete => {
                let directive = self.lifecycle.on(LifecycleEvent::InvocationComplete);
                self.apply(directive).await;
            }
        }
    }

    async fn accept(&mut self, envelope: &SpanEnvelope, deadline: Instant) {
        self.diagnostics.envelope_received();
        match self.batcher.push(envelope, Instant::now()) {
            Ok(sealed) => {
                for batch in sealed {
                    self.flusher.flush(batch, deadline).await;
                }
            }
            Err(Rejected::Oversized { size, limit }) => {
                self.diagnostics.oversized_dropped();
                warn!(
                    "dropping envelope from {}: {size} bytes exceeds the {limit} byte record ceiling",
                    envelope.source
                );
            }
            Err(e @ Rejected::Encode(_)) => {
                self.diagnostics.decode_error();
                error!("dropping envelope from {}: {e}", envelope.source);
            }
        }
    }

    async fn apply(&mut self, directive: Directive) {
        match directive {
            Directive::FlushAndRelease => {
                self.flush_open(FlushTrigger::InvocationComplete).await;
                if let Some(held) = self.held.take() {
                    let _ = held.ack.send(());
                }
            }
            Directive::Release => {
                if let Some(held) = self.held.take() {
                    let _ = held.ack.send(());
                }
            }
            Directive::Nothing | Directive::Hold { .. } | Directive::DrainAndExit { .. } => {}
        }
    }

    async fn flush_open(&mut self, trigger: FlushTrigger) {
        if let Some(batch) = self.batcher.seal(trigger) {
            self.flusher.flush(batch, self.flush_deadline()).await;
        }
    }

    fn flush_deadline(&self) -> Instant {
        match &self.held {
            Some(held) => held.deadline,
            None => Instant::now() + FLUSH_BUDGET,
        }
    }

    /// Takes in whatever the source already delivered, then flushes it all
    /// before `deadline`.
    async fn drain(&mut self, messages: &mut mpsc::Receiver<ChannelMessage>, deadline: Instant) {
        while let Ok(message) = messages.try_recv() {
            if let ChannelMessage::Envelope(envelope) = message {
                self.accept(&envelope, deadline).await;
            }
        }
        if let Some(batch) = self.batcher.seal(FlushTrigger::Shutdown) {
            self.flusher.flush(batch, deadline).await;
        }
        if let Some(held) = self.held.take() {
            let _ = held.ack.send(());
        }
    }
}

/// Registers with the host and runs the agent until shutdown.
pub async fn start(
    config: &AgentConfig,
    extension_name: &str,
    api: Arc<dyn ExtensionApi>,
    reader: EnvelopeReader,
    transport: Arc<dyn StreamTransport>,
) -> Result<DiagnosticsSnapshot, AgentError> {
    let id = api.register(extension_name).await?;
    info!("registered {extension_name} in {:?} mode", config.mode);

    let diagnostics = Arc::new(Diagnostics::default());
    let cancel = CancellationToken::new();
    let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
    let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);

    let reader_cancel = cancel.clone();
    let reader_diagnostics = diagnostics.clone();
    let reader_task = tokio::spawn(async move {
        let result = reader.run(message_tx, reader_diagnostics, reader_cancel).await;
        if let Err(e) = &result {
            error!("envelope source stopped: {e}");
        }
        result
    });
    let pump_task = tokio::spawn(pump_events(api, id, notice_tx, cancel.clone()));

    let agent = CaptureAgent::new(config, transport, diagnostics);
    let snapshot = agent.run(message_rx, notice_rx, cancel.clone()).await;

    cancel.cancel();
    let _ = pump_task.await;
    match reader_task.await {
        Ok(Err(e)) => return Err(AgentError::Source(e)),
        Ok(Ok(())) => {}
        Err(e) => error!("envelope reader task failed: {e}"),
    }
    Ok(snapshot)
}
