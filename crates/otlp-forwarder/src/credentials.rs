// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Vendor credentials and the store they are fetched from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::StoreError;

const TRACES_PATH: &str = "/v1/traces";
const SECRETS_TOKEN_HEADER: &str = "X-Aws-Parameters-Secrets-Token";

/// The secret document stored per vendor.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CredentialRecord {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub auth: String,
}

/// A resolved vendor destination. Immutable once fetched.
#[derive(Clone, Debug)]
pub struct VendorCredential {
    pub vendor: String,
    pub name: String,
    pub endpoint: String,
    pub headers: HeaderMap,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl VendorCredential {
    pub fn from_record(
        vendor: &str,
        record: CredentialRecord,
        fetched_at: Instant,
        ttl: Duration,
    ) -> Result<Self, StoreError> {
        if record.endpoint.trim().is_empty() {
            return Err(StoreError::Malformed {
                key: vendor.to_string(),
                reason: "endpoint is empty".to_string(),
            });
        }
        let headers = parse_auth(&record.auth).map_err(|reason| StoreError::Malformed {
            key: vendor.to_string(),
            reason,
        })?;
        Ok(VendorCredential {
            vendor: vendor.to_string(),
            name: record.name,
            endpoint: record.endpoint.trim().to_string(),
            headers,
            fetched_at,
            ttl,
        })
    }

    pub fn expires_at(&self) -> Instant {
        self.fetched_at + self.ttl
    }

    /// The OTLP/HTTP traces URL; a bare collector base gets the standard path.
    pub fn traces_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.ends_with(TRACES_PATH) {
            endpoint.to_string()
        } else {
            format!("{endpoint}{TRACES_PATH}")
        }
    }
}

/// Turns an `auth` value into outbound headers.
///
/// `name=value` pairs separated by commas each become a header. Anything
/// else (`Bearer abc`, `Basic dXNlcg==`) is sent verbatim as `Authorization`.
pub fn parse_auth(auth: &str) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    let auth = auth.trim();
    if auth.is_empty() {
        return Ok(headers);
    }

    let pairs: Option<Vec<(HeaderName, &str)>> = auth
        .split(',')
        .map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
            Some((name, value.trim()))
        })
        .collect();

    match pairs {
        Some(pairs) => {
            for (name, value) in pairs {
                let value = HeaderValue::from_str(value)
                    .map_err(|_| format!("value of header {name} is not a valid header value"))?;
                headers.insert(name, value);
            }
        }
        None => {
            let value = HeaderValue::from_str(auth)
                .map_err(|_| "auth is not a valid header value".to_string())?;
            headers.insert(AUTHORIZATION, value);
        }
    }
    for value in headers.values_mut() {
        value.set_sensitive(true);
    }
    Ok(headers)
}

/// Narrow capability the credential cache needs from a secret store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, vendor: &str) -> Result<CredentialRecord, StoreError>;
}

#[derive(Deserialize)]
struct SecretValue {
    #[serde(rename = "SecretString")]
    secret_string: String,
}

/// Reads secrets through the local secrets-cache HTTP endpoint the host
/// provides to functions.
pub struct ExtensionSecretStore {
    client: reqwest::Client,
    endpoint: String,
    prefix: String,
    session_token: Option<String>,
}

impl ExtensionSecretStore {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        prefix: &str,
        session_token: Option<String>,
    ) -> Self {
        ExtensionSecretStore {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            prefix: prefix.to_string(),
            session_token,
        }
    }

    pub fn secret_name(&self, vendor: &str) -> String {
        format!("{}{vendor}", self.prefix)
    }
}

#[async_trait]
impl SecretStore for ExtensionSecretStore {
    async fn fetch(&self, vendor: &str) -> Result<CredentialRecord, StoreError> {
        let secret_name = self.secret_name(vendor);
        let mut request = self
            .client
            .get(format!("{}/secretsmanager/get", self.endpoint))
            .query(&[("secretId", secret_name.as_str())]);
        if let Some(token) = &self.session_token {
            request = request.header(SECRETS_TOKEN_HEADER, token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(secret_name));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Unavailable(format!("{status}: {body}")));
        }
        let value: SecretValue = response.json().await.map_err(|e| StoreError::Malformed {
            key: secret_name.clone(),
            reason: e.to_string(),
        })?;
        let record = serde_json::from_str(&value.secret_string).map_err(|e| {
            StoreError::Malformed {
                key: secret_name.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!("fetched credential {secret_name}");
        Ok(record)
    }
}

/// Store double holding records in memory; counts fetches and can be made
/// unavailable or slow.
#[derive(Default)]
pub struct InMemorySecretStore {
    records: Mutex<HashMap<String, CredentialRecord>>,
    unavailable: AtomicBool,
    fetches: AtomicUsize,
    latency: Duration,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch takes `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        InMemorySecretStore {
            latency,
            ..Self::default()
        }
    }

    pub fn insert(&self, vendor: &str, endpoint: &str, auth: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(
                vendor.to_string(),
                CredentialRecord {
                    name: vendor.to_string(),
                    endpoint: endpoint.to_string(),
                    auth: auth.to_string(),
                },
            );
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn fetch(&self, vendor: &str) -> Result<CredentialRecord, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("store poisoned".to_string()))?
            .get(vendor)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(vendor.to_string()))
    }
}
