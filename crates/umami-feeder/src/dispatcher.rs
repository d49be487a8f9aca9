// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch dispatcher.
//!
//! A single long-lived task drains the event queue into batches. A batch is submitted when it
//! reaches `batchSize` or when `batchMaxWait` elapses, whichever comes first. Cancellation
//! triggers one final submission of whatever is pending, then the task ends.
//!
//! Delivery is best effort: a failed submission is logged and the batch is dropped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::event::Envelope;
use crate::http::{CollectorClient, CollectorError};
use crate::queue::EventReceiver;

/// Destination of event batches.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn submit(&self, batch: Vec<Envelope>) -> Result<(), CollectorError>;
}

/// Submits batches to the collector's batch endpoint.
#[derive(Debug, Clone)]
pub struct CollectorSink {
    client: CollectorClient,
    log_responses: bool,
}

impl CollectorSink {
    /// With `log_responses` set, the collector's answer to every batch is logged at debug level.
    #[must_use]
    pub fn new(client: CollectorClient, log_responses: bool) -> Self {
        Self {
            client,
            log_responses,
        }
    }
}

#[async_trait]
impl BatchSink for CollectorSink {
    async fn submit(&self, batch: Vec<Envelope>) -> Result<(), CollectorError> {
        let response = self.client.send_batch(&batch).await?;
        if self.log_responses {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), body = %body, "batch response");
        }
        Ok(())
    }
}

pub struct BatchDispatcher {
    sink: Arc<dyn BatchSink>,
    batch_size: usize,
    max_wait: Duration,
}

impl BatchDispatcher {
    #[must_use]
    pub fn new(sink: Arc<dyn BatchSink>, batch_size: usize, max_wait: Duration) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            max_wait,
        }
    }

    /// Runs until `cancel` fires or every queue sender is gone.
    ///
    /// A panic while batching is logged and the loop starts over with an empty batch.
    pub async fn run(self, mut rx: EventReceiver, cancel: CancellationToken) {
        loop {
            match AssertUnwindSafe(self.feed(&mut rx, &cancel))
                .catch_unwind()
                .await
            {
                Ok(()) => return,
                Err(panic) => {
                    error!(panic = panic_message(panic.as_ref()), "dispatcher panicked, restarting");
                }
            }
        }
    }

    async fn feed(&self, rx: &mut EventReceiver, cancel: &CancellationToken) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let timer = tokio::time::sleep(self.max_wait);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("dispatcher shutting down, performing final flush");
                    while let Some(event) = rx.try_recv() {
                        batch.push(Envelope::event(event));
                    }
                    if !batch.is_empty() {
                        self.flush(batch).await;
                    }
                    return;
                }
                () = &mut timer => {
                    if !batch.is_empty() {
                        self.flush(std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size))).await;
                    }
                    timer.as_mut().reset(Instant::now() + self.max_wait);
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        debug!("event queue closed, performing final flush");
                        if !batch.is_empty() {
                            self.flush(batch).await;
                        }
                        return;
                    };
                    batch.push(Envelope::event(event));
                    if batch.len() >= self.batch_size {
                        self.flush(std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size))).await;
                        timer.as_mut().reset(Instant::now() + self.max_wait);
                    }
                }
            }
        }
    }

    async fn flush(&self, batch: Vec<Envelope>) {
        let count = batch.len();
        debug!(count, "reporting events");
        if let Err(e) = self.sink.submit(batch).await {
            error!(count, error = %e, "failed to send events, dropping batch");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
