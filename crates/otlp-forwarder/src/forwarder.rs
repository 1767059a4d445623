// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The forwarding engine: turns one polled batch of stream records into
//! collector deliveries and reports a disposition per record.
//!
//! Records are processed concurrently up to a fixed limit and isolated from
//! each other: a record that fails to decode is dropped on its own, one that
//! runs into a transient failure is handed back for redelivery, and neither
//! affects its siblings. The batch is only reported once every record has
//! finished or been abandoned at the budget deadline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use otlp_envelope::compaction::compact;
use otlp_envelope::{split_record, SpanEnvelope};
use relay_stream::{RecordId, StreamRecord};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, debug_span, error, info_span, warn, Instrument};

use crate::config::ForwarderConfig;
use crate::credential_cache::CredentialCache;
use crate::credentials::SecretStore;
use crate::delivery::CollectorClient;
use crate::errors::{DeliveryError, ForwarderError};
use crate::http_utils::build_client;
use crate::router::Router;

/// What happened to one record. Ordered from best to worst.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Never retried: the record can not succeed as it is.
    Dropped(String),
    /// Redeliver the record on a later poll.
    Retryable(String),
}

impl DeliveryOutcome {
    fn rank(&self) -> u8 {
        match self {
            Self::Delivered => 0,
            Self::Dropped(_) => 1,
            Self::Retryable(_) => 2,
        }
    }

    fn worse(self, other: DeliveryOutcome) -> DeliveryOutcome {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordOutcome {
    pub record_id: RecordId,
    pub partition_key: String,
    pub outcome: DeliveryOutcome,
}

/// Per-record dispositions of one batch, in input order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchReport {
    pub fn delivered(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Delivered))
    }

    pub fn dropped(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Dropped(_)))
    }

    pub fn retryable(&self) -> usize {
        self.count(DeliveryOutcome::is_retryable)
    }

    fn count(&self, f: impl Fn(&DeliveryOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|r| f(&r.outcome)).count()
    }

    /// Records the host should hand back on a later poll.
    pub fn retry_ids(&self) -> Vec<RecordId> {
        self.outcomes
            .iter()
            .filter(|r| r.outcome.is_retryable())
            .map(|r| r.record_id.clone())
            .collect()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "records={} delivered={} dropped={} retryable={}",
            self.outcomes.len(),
            self.delivered(),
            self.dropped(),
            self.retryable()
        )
    }
}

pub struct ForwardingEngine {
    cache: Arc<CredentialCache>,
    client: CollectorClient,
    router: Router,
    compact: bool,
    max_concurrency: usize,
    budget_margin: Duration,
}

impl ForwardingEngine {
    pub fn new(cache: Arc<CredentialCache>, client: CollectorClient, router: Router) -> Self {
        ForwardingEngine {
            cache,
            client,
            router,
            compact: true,
            max_concurrency: 8,
            budget_margin: Duration::from_millis(500),
        }
    }

    /// Wires the engine from config around the given credential store.
    pub fn from_config(
        config: &ForwarderConfig,
        store: Arc<dyn SecretStore>,
    ) -> Result<Self, ForwarderError> {
        let http = build_client(config.https_proxy.as_deref(), config.request_timeout)
            .map_err(|e| ForwarderError::TransientIo(format!("building HTTP client: {e}")))?;
        let cache = Arc::new(CredentialCache::new(
            store,
            config.cache_ttl,
            config.cache_grace,
        ));
        Ok(
            Self::new(
                cache,
                CollectorClient::new(http, config.request_timeout),
                Router::new(config.default_vendor.clone()),
            )
            .with_compaction(config.compact)
            .with_max_concurrency(config.max_concurrency)
            .with_budget_margin(config.budget_margin),
        )
    }

    #[must_use]
    pub fn with_compaction(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_budget_margin(mut self, margin: Duration) -> Self {
        self.budget_margin = margin;
        self
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    /// Processes every record and waits for all of them. Work still running
    /// when `deadline` minus the budget margin arrives is abandoned and its
    /// record reported retryable.
    pub async fn process_batch(
        self: &Arc<Self>,
        records: Vec<StreamRecord>,
        deadline: Instant,
    ) -> BatchReport {
        let span = info_span!("process_batch", records = records.len());
        self.run_batch(records, deadline).instrument(span).await
    }

    async fn run_batch(
        self: &Arc<Self>,
        records: Vec<StreamRecord>,
        deadline: Instant,
    ) -> BatchReport {
        let work_deadline = deadline
            .checked_sub(self.budget_margin)
            .unwrap_or(deadline);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut outcomes: Vec<RecordOutcome> = records
            .iter()
            .map(|r| RecordOutcome {
                record_id: r.record_id.clone(),
                partition_key: r.partition_key.clone(),
                outcome: DeliveryOutcome::Retryable("record task did not finish".to_string()),
            })
            .collect();

        let mut tasks = JoinSet::new();
        for (idx, record) in records.into_iter().enumerate() {
            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let span = debug_span!(
                "record",
                record_id = %record.record_id,
                partition = %record.partition_key
            );
            let task = async move {
                let work = async {
                    let _permit = semaphore.acquire_owned().await.ok();
                    engine.process_record(&record, work_deadline).await
                };
                let outcome = match timeout_at(work_deadline, work).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(record_id = %record.record_id, "execution budget exhausted, record left for redelivery");
                        DeliveryOutcome::Retryable(ForwarderError::BudgetExceeded.to_string())
                    }
                };
                (idx, outcome)
            };
            tasks.spawn(task.instrument(span));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    if let Some(slot) = outcomes.get_mut(idx) {
                        slot.outcome = outcome;
                    }
                }
                Err(e) => error!("record task failed: {e}"),
            }
        }

        let report = BatchReport { outcomes };
        debug!("batch processed: {report}");
        report
    }

    async fn process_record(&self, record: &StreamRecord, deadline: Instant) -> DeliveryOutcome {
        let envelopes = match split_record(&record.data) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(record_id = %record.record_id, "dropping undecodable record: {e}");
                return DeliveryOutcome::Dropped(e.to_string());
            }
        };
        let envelopes = self.router.resolve(envelopes);
        let envelopes = if self.compact {
            match compact(envelopes.clone()) {
                Ok(compacted) => compacted,
                Err(e) => {
                    warn!(record_id = %record.record_id, "compaction failed, sending envelopes as is: {e}");
                    envelopes
                }
            }
        } else {
            envelopes
        };

        let mut worst = DeliveryOutcome::Delivered;
        for envelope in &envelopes {
            worst = worst.worse(self.deliver_envelope(envelope, deadline).await);
            // Redelivery resends the whole record; stop adding duplicates.
            if worst.is_retryable() {
                break;
            }
        }
        worst
    }

    async fn deliver_envelope(&self, envelope: &SpanEnvelope, deadline: Instant) -> DeliveryOutcome {
        let vendor = self.router.vendor_for(envelope);
        let span = debug_span!("deliver", vendor = %vendor, source = %envelope.source);
        self.deliver_to(vendor, envelope, deadline)
            .instrument(span)
            .await
    }

    async fn deliver_to(
        &self,
        vendor: &str,
        envelope: &SpanEnvelope,
        deadline: Instant,
    ) -> DeliveryOutcome {
        let credential = match self.cache.get(vendor).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(vendor = %vendor, "no usable credential: {e}");
                return DeliveryOutcome::Retryable(e.to_string());
            }
        };

        let rejection = match self.client.deliver(&credential, envelope, deadline).await {
            Ok(()) => return DeliveryOutcome::Delivered,
            Err(e) if e.is_auth() => e,
            Err(e) => return Self::classify(vendor, e),
        };

        debug!(vendor = %vendor, "credential rejected ({rejection}), refetching once");
        self.cache.invalidate_rejected(vendor, &credential).await;
        let credential = match self.cache.get(vendor).await {
            Ok(credential) => credential,
            Err(e) => return DeliveryOutcome::Retryable(e.to_string()),
        };
        match self.client.deliver(&credential, envelope, deadline).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) if e.is_auth() => {
                error!(vendor = %vendor, "refreshed credential rejected again: {e}");
                DeliveryOutcome::Retryable(
                    ForwarderError::Auth {
                        vendor: vendor.to_string(),
                    }
                    .to_string(),
                )
            }
            Err(e) => Self::classify(vendor, e),
        }
    }

    fn classify(vendor: &str, err: DeliveryError) -> DeliveryOutcome {
        if err.is_retryable() {
            warn!(vendor = %vendor, "delivery failed, will retry: {err}");
            DeliveryOutcome::Retryable(err.to_string())
        } else {
            warn!(vendor = %vendor, "delivery failed permanently, dropping: {err}");
            DeliveryOutcome::Dropped(err.to_string())
        }
    }
}
