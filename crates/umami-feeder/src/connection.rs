// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection and retry state machine.
//!
//! ```text
//! Idle -> Connecting{attempt} -> Active
//!              |  ^          \-> Disabled
//!              \--/ transient failure, wait retry_delay(attempt)
//! ```
//!
//! An attempt logs in (when credentials are configured), checks that the feeder has a way to
//! resolve websites, fetches the known websites and finally compiles the ignore rules.
//! Configuration problems disable the feeder for good; connectivity problems are retried.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::config::ConfigError;
use crate::dispatcher::{BatchDispatcher, BatchSink};
use crate::feeder::FeederState;
use crate::http::{CollectorClient, CollectorError};
use crate::matcher::Matcher;
use crate::queue::EventReceiver;

/// Upper bound of the wait between two attempts.
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Attempts after this one wait [`MAX_RETRY_INTERVAL`].
const LAST_EXPONENTIAL_ATTEMPT: u32 = 7;

/// Wait before connection attempt `attempt` (zero based).
///
/// The first attempt starts immediately, the next ones wait `base * 2^attempt` and from the
/// eighth retry on the wait is one hour. The result never exceeds one hour.
#[must_use]
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    if attempt > LAST_EXPONENTIAL_ATTEMPT {
        return MAX_RETRY_INTERVAL;
    }
    base.checked_mul(1 << attempt)
        .map_or(MAX_RETRY_INTERVAL, |delay| delay.min(MAX_RETRY_INTERVAL))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never started: the feeder is disabled in the configuration.
    Idle,
    /// Attempt `attempt` (one based) is running or waiting for its retry delay.
    Connecting { attempt: u32 },
    Active,
    /// Permanent failure; nothing is reported until the feeder is rebuilt.
    Disabled,
}

impl ConnectionState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Disabled)
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to get token: {0}")]
    Login(#[source] CollectorError),
    #[error("retrieved token is empty")]
    EmptyToken,
    #[error("failed to fetch websites: {0}")]
    FetchWebsites(#[source] CollectorError),
}

impl BootstrapError {
    /// Permanent errors are configuration mistakes that no retry can fix.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Drives the state machine of one feeder and starts its dispatcher once connected.
pub(crate) struct Connector {
    shared: Arc<FeederState>,
    client: CollectorClient,
    receiver: EventReceiver,
    sink: Arc<dyn BatchSink>,
    cancel: CancellationToken,
}

impl Connector {
    pub(crate) fn new(
        shared: Arc<FeederState>,
        client: CollectorClient,
        receiver: EventReceiver,
        sink: Arc<dyn BatchSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            client,
            receiver,
            sink,
            cancel,
        }
    }

    /// Retries until the feeder is active, disabled or cancelled.
    pub(crate) async fn run(self) {
        let base = self.shared.config.retry_base_delay;
        let mut attempt: u32 = 0;

        loop {
            let delay = retry_delay(attempt, base);
            self.shared
                .set_state(ConnectionState::Connecting { attempt: attempt + 1 });
            if attempt > 0 {
                debug!(delay = ?delay, next_attempt = attempt + 1, "waiting for next connection attempt");
            }
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("connection retries cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            let span = tracing::info_span!("connect", attempt);
            let result = tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("connection attempt cancelled");
                    return;
                }
                result = self.connect().instrument(span) => result,
            };

            match result {
                Ok(matcher) => {
                    self.activate(matcher);
                    return;
                }
                Err(e) if e.is_permanent() => {
                    error!(error = %e, "configuration error, the feeder is disabled");
                    self.shared.set_state(ConnectionState::Disabled);
                    return;
                }
                Err(e) => {
                    error!(attempt, error = %e, "failed to connect to umami");
                }
            }
        }
    }

    async fn connect(&self) -> Result<Matcher, BootstrapError> {
        let config = &self.shared.config;
        let resolver = &self.shared.resolver;

        if config.umami_host.is_empty() {
            return Err(ConfigError::MissingHost.into());
        }

        if config.has_credentials() {
            let token = self
                .client
                .login(&config.umami_username, &config.umami_password)
                .await
                .map_err(BootstrapError::Login)?;
            if token.is_empty() {
                return Err(BootstrapError::EmptyToken);
            }
            debug!("token received");
            resolver.set_token(token);
        }

        let token = resolver.token();
        if token.is_none() && resolver.is_empty() {
            return Err(ConfigError::MissingCredentials.into());
        }
        if token.is_none() && config.create_new_websites {
            return Err(ConfigError::TokenRequiredForCreate.into());
        }

        if let Some(token) = token {
            let websites = self
                .client
                .fetch_websites(&token, config.team_id())
                .await
                .map_err(BootstrapError::FetchWebsites)?;
            let added = resolver.seed(websites);
            debug!(added, total = resolver.len(), "websites fetched");
        }

        Ok(Matcher::new(config)?)
    }

    fn activate(self, matcher: Matcher) {
        let config = &self.shared.config;
        let dispatcher = BatchDispatcher::new(self.sink, config.batch_size, config.batch_max_wait);
        let handle = tokio::spawn(dispatcher.run(self.receiver, self.cancel));
        self.shared.push_task(handle);
        self.shared.activate(matcher);
        info!(websites = self.shared.resolver.len(), "connected to umami, feeder enabled");
    }
}
