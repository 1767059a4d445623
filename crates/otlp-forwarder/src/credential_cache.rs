// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-vendor credential cache with TTL expiry and single-flight refresh.
//!
//! Each vendor key owns one slot guarded by its own async lock. The caller
//! holding the lock performs the fetch; callers queued behind it observe the
//! outcome of that fetch instead of issuing their own. Slots never contend
//! with each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::credentials::{SecretStore, VendorCredential};
use crate::errors::{ForwarderError, StoreError};

/// Where an entry stands at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Never fetched, or invalidated.
    Absent,
    /// Inside its TTL.
    Valid,
    /// Past its TTL but still usable if a refresh fails.
    Stale,
    /// Past TTL and grace; only a successful refresh helps.
    Expired,
}

#[derive(Default)]
struct Entry {
    credential: Option<Arc<VendorCredential>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct Slot {
    entry: tokio::sync::Mutex<Entry>,
    // Bumped after every completed fetch, successful or not.
    completed_fetches: AtomicU64,
}

pub struct CredentialCache {
    store: Arc<dyn SecretStore>,
    ttl: Duration,
    grace: Duration,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn SecretStore>, ttl: Duration, grace: Duration) -> Self {
        CredentialCache {
            store,
            ttl,
            grace,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, vendor: &str) -> Result<Arc<Slot>, ForwarderError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| ForwarderError::TransientIo("credential cache poisoned".to_string()))?;
        Ok(slots.entry(vendor.to_string()).or_default().clone())
    }

    fn existing_slot(&self, vendor: &str) -> Option<Arc<Slot>> {
        self.slots.lock().ok()?.get(vendor).cloned()
    }

    /// Drops the vendor's slot if it is still `slot`.
    fn forget(&self, vendor: &str, slot: &Arc<Slot>) {
        if let Ok(mut slots) = self.slots.lock() {
            if slots
                .get(vendor)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                slots.remove(vendor);
            }
        }
    }

    /// Number of vendors with a slot.
    pub fn tracked_vendors(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    fn classify(&self, credential: Option<&VendorCredential>, now: Instant) -> EntryState {
        match credential {
            None => EntryState::Absent,
            Some(c) if now < c.expires_at() => EntryState::Valid,
            Some(c) if now < c.expires_at() + self.grace => EntryState::Stale,
            Some(_) => EntryState::Expired,
        }
    }

    /// State of a vendor's entry right now.
    pub async fn state(&self, vendor: &str) -> EntryState {
        let Some(slot) = self.existing_slot(vendor) else {
            return EntryState::Absent;
        };
        let entry = slot.entry.lock().await;
        self.classify(entry.credential.as_deref(), Instant::now())
    }

    /// Returns the vendor's credential, fetching it at most once per expiry
    /// no matter how many callers ask concurrently.
    pub async fn get(&self, vendor: &str) -> Result<Arc<VendorCredential>, ForwarderError> {
        let slot = self.slot(vendor)?;
        let seen = slot.completed_fetches.load(Ordering::Acquire);
        let mut entry = slot.entry.lock().await;

        let state = self.classify(entry.credential.as_deref(), Instant::now());
        if state == EntryState::Valid {
            if let Some(credential) = &entry.credential {
                return Ok(credential.clone());
            }
        }

        // A fetch completed while this caller waited for the lock: share its
        // failure rather than hitting the store again.
        if slot.completed_fetches.load(Ordering::Acquire) != seen {
            if let Some(reason) = entry.last_error.clone() {
                return self.fallback(vendor, &entry, state, reason);
            }
        }

        debug!("fetching credential for vendor {vendor} ({state:?})");
        let fetched = self.store.fetch(vendor).await;
        let fetched_at = Instant::now();
        let result = fetched.and_then(|record| {
            VendorCredential::from_record(vendor, record, fetched_at, self.ttl)
        });
        slot.completed_fetches.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(credential) => {
                let credential = Arc::new(credential);
                entry.credential = Some(credential.clone());
                entry.last_error = None;
                Ok(credential)
            }
            Err(e) => {
                let reason = e.to_string();
                entry.last_error = Some(reason.clone());
                if let StoreError::NotFound(_) | StoreError::Malformed { .. } = e {
                    warn!("credential for vendor {vendor} unusable: {reason}");
                }
                // Unknown vendor tags must not pile up slots.
                if matches!(e, StoreError::NotFound(_)) && entry.credential.is_none() {
                    self.forget(vendor, &slot);
                }
                self.fallback(vendor, &entry, state, reason)
            }
        }
    }

    fn fallback(
        &self,
        vendor: &str,
        entry: &Entry,
        state: EntryState,
        reason: String,
    ) -> Result<Arc<VendorCredential>, ForwarderError> {
        match (&entry.credential, state) {
            (Some(credential), EntryState::Stale | EntryState::Valid) => {
                warn!("refreshing credential for vendor {vendor} failed ({reason}), serving last known good");
                Ok(credential.clone())
            }
            _ => Err(ForwarderError::TransientIo(format!(
                "credential for vendor {vendor}: {reason}"
            ))),
        }
    }

    /// Forces the next `get` for this vendor to refetch.
    pub async fn invalidate(&self, vendor: &str) {
        if let Some(slot) = self.existing_slot(vendor) {
            let mut entry = slot.entry.lock().await;
            entry.credential = None;
            entry.last_error = None;
            debug!("invalidated credential for vendor {vendor}");
        }
    }

    /// Invalidates only if `rejected` is still the cached credential, so
    /// concurrent rejections of one credential trigger a single refetch.
    pub async fn invalidate_rejected(&self, vendor: &str, rejected: &Arc<VendorCredential>) {
        if let Some(slot) = self.existing_slot(vendor) {
            let mut entry = slot.entry.lock().await;
            if entry
                .credential
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, rejected))
            {
                entry.credential = None;
                entry.last_error = None;
                debug!("invalidated rejected credential for vendor {vendor}");
            }
        }
    }
}
