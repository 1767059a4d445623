// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use otlp_envelope::MAX_RECORD_BYTES;

pub const DEFAULT_PIPE_PATH: &str = "/tmp/otlp-stdout-span-exporter.pipe";
const DEFAULT_PARTITION_KEY: &str = "span-capture";

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

/// When a flush happens relative to the invocation that produced the spans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProcessorMode {
    /// Hold the host until the invocation's spans are appended.
    Sync,
    /// Flush on count and time triggers while the function keeps running.
    #[default]
    Async,
}

impl FromStr for ProcessorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(format!("expected sync or async, got {other}")),
        }
    }
}

/// How the function's exporter hands envelopes to the agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputType {
    /// Envelopes go to the function's stdout and reach the forwarder through
    /// the platform log stream; the agent has nothing to drain.
    Stdout,
    /// Named pipe shared by the function and the agent.
    #[default]
    Pipe,
    /// In-process channel, for embedding the agent next to the exporter.
    Direct,
}

impl FromStr for OutputType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "pipe" => Ok(Self::Pipe),
            "direct" => Ok(Self::Direct),
            other => Err(format!("expected stdout, pipe or direct, got {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    pub mode: ProcessorMode,
    pub output_type: OutputType,
    pub pipe_path: PathBuf,
    /// Count flush trigger.
    pub max_records: usize,
    /// Time-window flush trigger, measured from the first envelope of a batch.
    pub max_wait: Duration,
    /// Byte ceiling of one appended record.
    pub max_record_bytes: usize,
    pub partition_key: String,
    pub append_max_attempts: u32,
    pub append_backoff: Duration,
    /// Host extension API address, absent when running outside the host.
    pub runtime_api: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            mode: ProcessorMode::default(),
            output_type: OutputType::default(),
            pipe_path: PathBuf::from(DEFAULT_PIPE_PATH),
            max_records: 100,
            max_wait: Duration::from_millis(5000),
            max_record_bytes: MAX_RECORD_BYTES,
            partition_key: DEFAULT_PARTITION_KEY.to_string(),
            append_max_attempts: 3,
            append_backoff: Duration::from_millis(100),
            runtime_api: None,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let partition_key = env::var("SPAN_CAPTURE_PARTITION_KEY")
            .or_else(|_| env::var("AWS_LAMBDA_FUNCTION_NAME"))
            .unwrap_or(defaults.partition_key);

        let config = AgentConfig {
            mode: parse_var("LAMBDA_EXTENSION_SPAN_PROCESSOR_MODE", defaults.mode)?,
            output_type: parse_var("OTLP_STDOUT_SPAN_EXPORTER_OUTPUT_TYPE", defaults.output_type)?,
            pipe_path: env::var("SPAN_CAPTURE_PIPE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.pipe_path),
            max_records: parse_var("SPAN_CAPTURE_MAX_RECORDS", defaults.max_records)?,
            max_wait: Duration::from_millis(parse_var(
                "SPAN_CAPTURE_MAX_WAIT_MS",
                defaults.max_wait.as_millis() as u64,
            )?),
            max_record_bytes: parse_var("SPAN_CAPTURE_MAX_RECORD_BYTES", defaults.max_record_bytes)?,
            partition_key,
            append_max_attempts: parse_var(
                "SPAN_CAPTURE_APPEND_MAX_ATTEMPTS",
                defaults.append_max_attempts,
            )?,
            append_backoff: Duration::from_millis(parse_var(
                "SPAN_CAPTURE_APPEND_BACKOFF_MS",
                defaults.append_backoff.as_millis() as u64,
            )?),
            runtime_api: env::var("AWS_LAMBDA_RUNTIME_API")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_records == 0 {
            return Err(invalid("SPAN_CAPTURE_MAX_RECORDS", 0, "must be at least 1"));
        }
        if self.max_wait.is_zero() {
            return Err(invalid("SPAN_CAPTURE_MAX_WAIT_MS", 0, "must be greater than 0"));
        }
        if self.max_record_bytes == 0 {
            return Err(invalid("SPAN_CAPTURE_MAX_RECORD_BYTES", 0, "must be greater than 0"));
        }
        if self.append_max_attempts == 0 {
            return Err(invalid("SPAN_CAPTURE_APPEND_MAX_ATTEMPTS", 0, "must be at least 1"));
        }
        if self.partition_key.trim().is_empty() {
            return Err(invalid("SPAN_CAPTURE_PARTITION_KEY", "", "cannot be empty"));
        }
        Ok(())
    }

    /// Host extension API address, required once the agent registers.
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
