// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Captures waiting for their website to be created on the collector.
//!
//! One lookup task runs per hostname and every capture for that hostname parks behind it, so a
//! slow or failing collector sees a single create call per hostname at a time. The number of
//! concurrent lookups and the number of parked captures are both bounded; past either bound the
//! capture is shed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::StatusCode;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;

use crate::event::RequestInfo;

/// Hostnames looked up concurrently at most.
pub(crate) const MAX_PENDING_LOOKUPS: usize = 8;

#[derive(Debug)]
pub(crate) struct Parked {
    pub(crate) request: RequestInfo,
    pub(crate) status: StatusCode,
}

#[derive(Debug)]
pub(crate) enum Park {
    /// First capture for the hostname; the caller must start the lookup and hold the permit
    /// until it finishes.
    Lookup(OwnedSemaphorePermit),
    /// Parked behind a running lookup.
    Waiting,
    /// Shed: too many lookups or parked captures.
    Full(Parked),
}

#[derive(Debug, Default)]
struct Waiting {
    by_host: HashMap<String, Vec<Parked>>,
    parked: usize,
}

#[derive(Debug)]
pub(crate) struct PendingLookups {
    waiting: Mutex<Waiting>,
    permits: Arc<Semaphore>,
    max_parked: usize,
    tasks: TaskTracker,
}

impl PendingLookups {
    /// `max_parked` is clamped to at least one.
    pub(crate) fn new(max_lookups: usize, max_parked: usize) -> Self {
        Self {
            waiting: Mutex::new(Waiting::default()),
            permits: Arc::new(Semaphore::new(max_lookups)),
            max_parked: max_parked.max(1),
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn park(&self, hostname: &str, capture: Parked) -> Park {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting.parked >= self.max_parked {
            return Park::Full(capture);
        }
        if let Some(parked) = waiting.by_host.get_mut(hostname) {
            parked.push(capture);
            waiting.parked += 1;
            return Park::Waiting;
        }
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return Park::Full(capture);
        };
        waiting.by_host.insert(hostname.to_string(), vec![capture]);
        waiting.parked += 1;
        Park::Lookup(permit)
    }

    /// Removes and returns everything parked for `hostname`.
    pub(crate) fn take(&self, hostname: &str) -> Vec<Parked> {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        let parked = waiting.by_host.remove(hostname).unwrap_or_default();
        waiting.parked -= parked.len();
        parked
    }

    pub(crate) fn parked(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .parked
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }
}
