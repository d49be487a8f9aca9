// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log output for the feeder.
//!
//! Lines are prefixed with `UMAMI_FEEDER` so they can be told apart from the logs of the
//! application the middleware is mounted in:
//!
//! ```text
//! UMAMI_FEEDER | WARN | queue full, dropping event hostname=example.com
//! UMAMI_FEEDER | ERROR | connect{attempt=3}: unable to fetch websites error=...
//! ```

use std::env;
use std::fmt;

use thiserror::Error;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Overrides the level derived from the `debug` flag, e.g. `UMAMI_LOG_LEVEL=trace`.
pub const LOG_LEVEL_ENV: &str = "UMAMI_LOG_LEVEL";

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("could not parse log level: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("setting default subscriber failed: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Formats events as `UMAMI_FEEDER | LEVEL | spans: message fields`.
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
        write!(&mut writer, "UMAMI_FEEDER | {} | ", event.metadata().level())?;

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

/// Filter directive for the feeder: noisy HTTP internals are silenced.
fn filter_directive(debug: bool, level_override: Option<String>) -> String {
    let level = level_override
        .map(|level| level.to_lowercase())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| if debug { "debug" } else { "info" }.to_string());
    format!("h2=off,hyper=off,rustls=off,{level}")
}

/// Installs the global subscriber.
pub fn init(debug: bool) -> Result<(), LoggerError> {
    let filter = EnvFilter::try_new(filter_directive(debug, env::var(LOG_LEVEL_ENV).ok()))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::debug!("logging subsystem enabled");
    Ok(())
}
