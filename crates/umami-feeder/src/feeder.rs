// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The feeder: owns the pipeline state shared by the request path, the connection task and the
//! dispatcher task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use axum::http::StatusCode;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::connection::{ConnectionState, Connector};
use crate::dispatcher::{BatchSink, CollectorSink};
use crate::event::{Event, RequestInfo};
use crate::http::{CollectorClient, CollectorError};
use crate::matcher::Matcher;
use crate::pending::{Park, Parked, PendingLookups, MAX_PENDING_LOOKUPS};
use crate::queue::{self, EventSender};
use crate::resolver::SiteResolver;

/// State of one feeder instance.
///
/// `active` is written only by the connection task, once. The matcher is set right before it.
pub(crate) struct FeederState {
    pub(crate) config: Arc<Config>,
    pub(crate) resolver: SiteResolver,
    active: AtomicBool,
    matcher: OnceLock<Matcher>,
    sender: EventSender,
    pending: PendingLookups,
    state_tx: watch::Sender<ConnectionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FeederState {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn matcher(&self) -> Option<&Matcher> {
        self.is_active().then(|| self.matcher.get()).flatten()
    }

    pub(crate) fn activate(&self, matcher: Matcher) {
        if self.matcher.set(matcher).is_err() {
            error!("feeder already activated");
            return;
        }
        self.active.store(true, Ordering::Release);
        self.set_state(ConnectionState::Active);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Reports tracked requests to an Umami collector.
///
/// Cloning is cheap; clones share the same pipeline. Construction spawns the connection task,
/// so it must happen inside a Tokio runtime.
#[derive(Clone)]
pub struct UmamiFeeder {
    shared: Arc<FeederState>,
    cancel: CancellationToken,
}

impl UmamiFeeder {
    /// Builds a feeder that submits batches to the collector at `umamiHost`.
    ///
    /// Cancelling `cancel` stops connection retries and makes the dispatcher flush pending events.
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self, CollectorError> {
        let client = CollectorClient::new(config.umami_host.clone(), config.request_timeout)?;
        let sink = Arc::new(CollectorSink::new(client.clone(), config.debug));
        Ok(Self::build(config, client, sink, cancel))
    }

    /// Like [`UmamiFeeder::new`], with batches handed to `sink` instead of the collector.
    pub fn with_sink(
        config: Config,
        sink: Arc<dyn BatchSink>,
        cancel: CancellationToken,
    ) -> Result<Self, CollectorError> {
        let client = CollectorClient::new(config.umami_host.clone(), config.request_timeout)?;
        Ok(Self::build(config, client, sink, cancel))
    }

    fn build(
        config: Config,
        client: CollectorClient,
        sink: Arc<dyn BatchSink>,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = queue::channel(config.queue_size);
        let token = Some(config.umami_token.clone()).filter(|token| !token.is_empty());
        let resolver = SiteResolver::new(
            client.clone(),
            &config.websites,
            token,
            config.team_id().map(str::to_string),
        );
        let pending = PendingLookups::new(MAX_PENDING_LOOKUPS, config.queue_size);
        let enabled = config.is_enabled();
        let initial = if enabled {
            ConnectionState::Connecting { attempt: 1 }
        } else {
            ConnectionState::Idle
        };
        let (state_tx, _) = watch::channel(initial);

        let shared = Arc::new(FeederState {
            config: Arc::new(config),
            resolver,
            active: AtomicBool::new(false),
            matcher: OnceLock::new(),
            sender,
            pending,
            state_tx,
            tasks: Mutex::new(Vec::new()),
        });

        if enabled {
            let connector = Connector::new(
                Arc::clone(&shared),
                client,
                receiver,
                sink,
                cancel.clone(),
            );
            shared.push_task(tokio::spawn(connector.run()));
        } else {
            debug!("feeder disabled by configuration");
        }

        Self { shared, cancel }
    }

    /// `true` once the connection succeeded and events are being dispatched.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Receives every connection state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Events dropped because the queue or the website lookup backlog was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.shared.sender.dropped()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Decides before the request is served whether its response should be observed.
    #[must_use]
    pub fn should_track(&self, request: &RequestInfo) -> bool {
        let Some(matcher) = self.shared.matcher() else {
            return false;
        };
        if !matcher.should_track_request(request) {
            return false;
        }
        if !matcher.should_track_resource(&request.path) {
            debug!(path = %request.path, "ignoring resource");
            return false;
        }

        let hostname = request.hostname();
        if hostname.is_empty() {
            debug!("ignoring request without host");
            return false;
        }
        if self.shared.config.create_new_websites || self.shared.resolver.contains(&hostname) {
            return true;
        }
        debug!(hostname = %hostname, "ignoring domain");
        false
    }

    /// Reports the request once its final status is known. Never waits on the collector.
    pub fn capture(&self, request: RequestInfo, status: StatusCode) {
        let Some(matcher) = self.shared.matcher() else {
            return;
        };
        if !matcher.should_track_status(status) {
            return;
        }

        let hostname = request.hostname();
        if hostname.is_empty() {
            return;
        }
        if let Some(website) = self.shared.resolver.lookup(&hostname) {
            self.submit(&request, &website, status);
            return;
        }
        if !self.shared.config.create_new_websites {
            error!(hostname = %hostname, "tracking skipped, website id is unknown");
            return;
        }

        let permit = match self.shared.pending.park(&hostname, Parked { request, status }) {
            Park::Lookup(permit) => permit,
            Park::Waiting => return,
            Park::Full(_) => {
                self.shared.sender.record_dropped();
                warn!(
                    hostname = %hostname,
                    parked = self.shared.pending.parked(),
                    "failed to submit event: too many pending website lookups"
                );
                return;
            }
        };

        let feeder = self.clone();
        self.shared.pending.tasks().spawn(async move {
            let website = feeder.shared.resolver.resolve(&hostname).await;
            let parked = feeder.shared.pending.take(&hostname);
            drop(permit);
            match website {
                Some(website) => {
                    for Parked { request, status } in parked {
                        feeder.submit(&request, &website, status);
                    }
                }
                None => error!(
                    hostname = %hostname,
                    events = parked.len(),
                    "tracking skipped, website id is unknown"
                ),
            }
        });
    }

    /// Website lookups started by [`UmamiFeeder::capture`] that have not finished yet.
    #[must_use]
    pub fn pending_lookups(&self) -> usize {
        self.shared.pending.tasks().len()
    }

    fn submit(&self, request: &RequestInfo, website: &str, status: StatusCode) {
        let event = Event::from_request(
            request,
            website,
            status,
            &self.shared.config.capture_headers,
        );
        self.shared.sender.enqueue(event);
    }

    /// Waits for running website lookups, then cancels the pipeline and waits for the connection
    /// and dispatcher tasks, so every accepted event is flushed before this returns.
    ///
    /// Events still waiting on a lookup when the token is cancelled by other means are dropped.
    pub async fn shutdown(&self) {
        let lookups = self.shared.pending.tasks();
        lookups.close();
        lookups.wait().await;
        self.cancel.cancel();
        loop {
            let tasks = self.shared.take_tasks();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "feeder task failed");
                }
            }
        }
        debug!("feeder stopped");
    }
}
