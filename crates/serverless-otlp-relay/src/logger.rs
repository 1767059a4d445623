// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log setup shared by both binaries.
//!
//! Lines look like `OTLP_RELAY | LEVEL | span{fields}: message fields` and go
//! to stderr, leaving stdout to records when it is the transport.

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_VAR: &str = "RELAY_LOG_LEVEL";
const LOG_PREFIX: &str = "OTLP_RELAY";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("could not parse log level: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("setting default subscriber failed: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{LOG_PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter directives for `level`, with the HTTP stack silenced.
pub fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    Ok(EnvFilter::try_new(format!(
        "h2=off,hyper=off,rustls=off,{}",
        level.to_lowercase()
    ))?)
}

/// Installs the global subscriber, reading the level from `RELAY_LOG_LEVEL`.
pub fn init() -> Result<(), LoggingError> {
    let level = std::env::var(LOG_LEVEL_VAR).unwrap_or_else(|_| "info".to_string());
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(&level)?)
        .with_writer(std::io::stderr)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
