// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SECRETS_PREFIX: &str = "serverless-otlp-forwarder/keys/";
pub const DEFAULT_SECRETS_ENDPOINT: &str = "http://localhost:2773";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Forwarder settings, read once at cold start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwarderConfig {
    pub cache_ttl: Duration,
    /// How long past its TTL a credential may still be served when the
    /// refresh fails.
    pub cache_grace: Duration,
    pub secrets_prefix: String,
    pub default_vendor: String,
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    /// Tail of the invocation budget kept free of outbound calls.
    pub budget_margin: Duration,
    pub compact: bool,
    pub secrets_endpoint: String,
    pub max_poll_records: usize,
    pub max_poll_wait: Duration,
    /// Time budget of one self-polled batch.
    pub poll_budget: Duration,
    pub https_proxy: Option<String>,
    pub runtime_api: Option<String>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            cache_ttl: Duration::from_secs(300),
            cache_grace: Duration::from_secs(60),
            secrets_prefix: DEFAULT_SECRETS_PREFIX.to_string(),
            default_vendor: "default".to_string(),
            max_concurrency: 8,
            request_timeout: Duration::from_millis(10_000),
            budget_margin: Duration::from_millis(500),
            compact: true,
            secrets_endpoint: DEFAULT_SECRETS_ENDPOINT.to_string(),
            max_poll_records: 100,
            max_poll_wait: Duration::from_millis(5000),
            poll_budget: Duration::from_millis(30_000),
            https_proxy: None,
            runtime_api: None,
        }
    }
}

impl ForwarderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = ForwarderConfig {
            cache_ttl: Duration::from_secs(parse_var("CACHE_TTL_SECONDS", d.cache_ttl.as_secs())?),
            cache_grace: Duration::from_secs(parse_var(
                "CACHE_GRACE_SECONDS",
                d.cache_grace.as_secs(),
            )?),
            secrets_prefix: env::var("SECRETS_PREFIX").unwrap_or(d.secrets_prefix),
            default_vendor: env::var("OTLP_FORWARDER_DEFAULT_VENDOR")
                .map(|v| v.trim().to_string())
                .unwrap_or(d.default_vendor),
            max_concurrency: parse_var("OTLP_FORWARDER_MAX_CONCURRENCY", d.max_concurrency)?,
            request_timeout: Duration::from_millis(parse_var(
                "OTLP_FORWARDER_REQUEST_TIMEOUT_MS",
                d.request_timeout.as_millis() as u64,
            )?),
            budget_margin: Duration::from_millis(parse_var(
                "OTLP_FORWARDER_BUDGET_MARGIN_MS",
                d.budget_margin.as_millis() as u64,
            )?),
            compact: env::var("OTLP_FORWARDER_COMPACT")
                .map(|val| val.to_lowercase() != "false")
                .unwrap_or(d.compact),
            secrets_endpoint: env::var("OTLP_FORWARDER_SECRETS_ENDPOINT")
                .unwrap_or(d.secrets_endpoint),
            max_poll_records: parse_var("OTLP_FORWARDER_MAX_POLL_RECORDS", d.max_poll_records)?,
            max_poll_wait: Duration::from_millis(parse_var(
                "OTLP_FORWARDER_MAX_POLL_WAIT_MS",
                d.max_poll_wait.as_millis() as u64,
            )?),
            poll_budget: Duration::from_millis(parse_var(
                "OTLP_FORWARDER_POLL_BUDGET_MS",
                d.poll_budget.as_millis() as u64,
            )?),
            https_proxy: env::var("HTTPS_PROXY")
                .or_else(|_| env::var("https_proxy"))
                .ok()
                .filter(|v| !v.trim().is_empty()),
            runtime_api: env::var("AWS_LAMBDA_RUNTIME_API")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl.is_zero() {
            return Err(invalid("CACHE_TTL_SECONDS", 0, "must be greater than 0"));
        }
        if self.secrets_prefix.trim().is_empty() {
            return Err(invalid("SECRETS_PREFIX", "", "cannot be empty"));
        }
        if self.default_vendor.is_empty() {
            return Err(invalid("OTLP_FORWARDER_DEFAULT_VENDOR", "", "cannot be empty"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("OTLP_FORWARDER_MAX_CONCURRENCY", 0, "must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("OTLP_FORWARDER_REQUEST_TIMEOUT_MS", 0, "must be greater than 0"));
        }
        if self.max_poll_records == 0 {
            return Err(invalid("OTLP_FORWARDER_MAX_POLL_RECORDS", 0, "must be at least 1"));
        }
        if self.poll_budget <= self.budget_margin {
            return Err(invalid(
                "OTLP_FORWARDER_POLL_BUDGET_MS",
                self.poll_budget.as_millis(),
                "must exceed OTLP_FORWARDER_BUDGET_MARGIN_MS",
            ));
        }
        Ok(())
    }

    pub fn require_runtime_api(&self) -> Result<&str, ConfigError> {
        self.runtime_api
            .as_deref()
            .ok_or(ConfigError::Missing("AWS_LAMBDA_RUNTIME_API"))
    }
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid {
                name,
                value,
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn invalid(name: &'static str, value: impl Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use duplicate::duplicate_item;
    use serial_test::serial;
    use std::env;

    use super::*;

    const VARS: &[&str] = &[
        "CACHE_TTL_SECONDS",
        "CACHE_GRACE_SECONDS",
        "SECRETS_PREFIX",
        "OTLP_FORWARDER_DEFAULT_VENDOR",
        "OTLP_FORWARDER_MAX_CONCURRENCY",
        "OTLP_FORWARDER_REQUEST_TIMEOUT_MS",
        "OTLP_FORWARDER_BUDGET_MARGIN_MS",
        "OTLP_FORWARDER_COMPACT",
        "OTLP_FORWARDER_SECRETS_ENDPOINT",
        "OTLP_FORWARDER_MAX_POLL_RECORDS",
        "OTLP_FORWARDER_MAX_POLL_WAIT_MS",
        "OTLP_FORWARDER_POLL_BUDGET_MS",
        "HTTPS_PROXY",
        "https_proxy",
        "AWS_LAMBDA_RUNTIME_API",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = ForwarderConfig::from_env().unwrap();
        assert_eq!(config, ForwarderConfig::default());
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.secrets_prefix, "serverless-otlp-forwarder/keys/");
        assert!(config.compact);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        env::set_var("CACHE_TTL_SECONDS", "30");
        env::set_var("SECRETS_PREFIX", "team-a/keys/");
        env::set_var("OTLP_FORWARDER_COMPACT", "FALSE");
        env::set_var("HTTPS_PROXY", "http://proxy:3128");
        let config = ForwarderConfig::from_env().unwrap();
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.secrets_prefix, "team-a/keys/");
        assert!(!config.compact);
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
        clear_env();
    }

    #[duplicate_item(
        test_name                         var                                  value;
        [test_rejects_zero_ttl]           ["CACHE_TTL_SECONDS"]                ["0"];
        [test_rejects_negative_ttl]       ["CACHE_TTL_SECONDS"]                ["-5"];
        [test_rejects_zero_concurrency]   ["OTLP_FORWARDER_MAX_CONCURRENCY"]   ["0"];
        [test_rejects_blank_prefix]       ["SECRETS_PREFIX"]                   ["  "];
        [test_rejects_unparsable_timeout] ["OTLP_FORWARDER_REQUEST_TIMEOUT_MS"] ["ten"];
    )]
    #[test]
    #[serial]
    fn test_name() {
        clear_env();
        env::set_var(var, value);
        let err = ForwarderConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name, .. } if name == var));
        clear_env();
    }
}
