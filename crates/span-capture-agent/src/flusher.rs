// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use relay_stream::{SequenceToken, StreamTransport, TransportError};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::batch::SealedBatch;
use crate::diagnostics::Diagnostics;

/// Upper bound of a single backoff pause.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    Appended { token: SequenceToken, attempts: u32 },
    Dropped { attempts: u32 },
}

/// Appends sealed batches to the stream, retrying with exponential backoff.
///
/// Delivery is best effort: when attempts run out, or the next backoff would
/// run past the deadline, the batch is dropped and counted.
pub struct Flusher {
    transport: Arc<dyn StreamTransport>,
    partition_key: String,
    max_attempts: u32,
    backoff: Duration,
    diagnostics: Arc<Diagnostics>,
}

impl Flusher {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        partition_key: String,
        max_attempts: u32,
        backoff: Duration,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Flusher {
            transport,
            partition_key,
            max_attempts: max_attempts.max(1),
            backoff,
            diagnostics,
        }
    }

    pub async fn flush(&self, batch: SealedBatch, deadline: Instant) -> FlushOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.append(&batch, deadline).await {
                Ok(token) => {
                    debug!(
                        "appended {} envelopes ({} bytes) on {} trigger as {}",
                        batch.envelopes,
                        batch.data.len(),
                        batch.trigger,
                        token.0
                    );
                    self.diagnostics.batch_appended();
                    return FlushOutcome::Appended { token, attempts };
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                error!("dropping batch of {} envelopes: {err}", batch.envelopes);
                self.diagnostics.batch_dropped();
                return FlushOutcome::Dropped { attempts };
            }
            if attempts >= self.max_attempts {
                error!(
                    "dropping batch of {} envelopes after {attempts} attempts: {err}",
                    batch.envelopes
                );
                self.diagnostics.batch_dropped();
                return FlushOutcome::Dropped { attempts };
            }

            let backoff = self.backoff_after(attempts);
            if Instant::now() + backoff >= deadline {
                error!(
                    "dropping batch of {} envelopes, no time left to retry: {err}",
                    batch.envelopes
                );
                self.diagnostics.batch_dropped();
                return FlushOutcome::Dropped { attempts };
            }
            warn!("append attempt {attempts} failed: {err}, retrying in {backoff:?}");
            self.diagnostics.append_retried();
            tokio::time::sleep(backoff).await;
        }
    }

    /// Pause after the given number of failed attempts: doubles each time,
    /// capped at [`MAX_BACKOFF`].
    fn backoff_after(&self, attempts: u32) -> Duration {
        2_u32
            .checked_pow(attempts.saturating_sub(1))
            .and_then(|factor| self.backoff.checked_mul(factor))
            .map_or(MAX_BACKOFF, |backoff| backoff.min(MAX_BACKOFF))
    }

    async fn append(
        &self,
        batch: &SealedBatch,
        deadline: Instant,
    ) -> Result<SequenceToken, TransportError> {
        let append = self
            .transport
            .append(&self.partition_key, batch.data.clone());
        tokio::time::timeout_at(deadline, append)
            .await
            .unwrap_or_else(|_| Err(TransportError::Unavailable("deadline reached".to_string())))
    }
}
