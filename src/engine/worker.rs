//! Status-change worker: receive, parse, apply, acknowledge.
//!
//! The sole consumer of the event queue. Acknowledges a delivery only once
//! it is applied, recognized as already applied, or found to be malformed.
//! Anything else is left on the queue and comes back after the visibility
//! timeout. Any number of workers may share a queue and store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{Instrument, error, info, warn};

use crate::error::Result;
use crate::model::StatusChangedEvent;
use crate::queue::{AckHandle, Delivery, EventQueue, ReceiveOptions};
use crate::store::{ApplyOutcome, RequestStore};
use crate::telemetry::event::{record_disposition, record_event, start_delivery_span};
use crate::telemetry::metrics;

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub receive: ReceiveOptions,
    /// Pause after a failed receive before trying again.
    pub receive_error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            receive: ReceiveOptions::default(),
            receive_error_backoff: Duration::from_secs(1),
        }
    }
}

/// What the worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Event appended to history.
    Applied,
    /// Already the last applied event, or the request is missing.
    Duplicate,
    /// Body was not a valid event. Dropped without retry.
    Discarded,
    /// Store failure. Left for redelivery.
    Retained,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Applied => "applied",
            Disposition::Duplicate => "duplicate",
            Disposition::Discarded => "discarded",
            Disposition::Retained => "retained",
        }
    }

    /// Whether this disposition calls for deleting the message.
    pub fn should_ack(self) -> bool {
        !matches!(self, Disposition::Retained)
    }
}

/// Outcome of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handled {
    pub disposition: Disposition,
    /// The delete went through. False for retained deliveries and failed deletes.
    pub acked: bool,
}

/// Tally of one receive + process cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub discarded: usize,
    pub retained: usize,
    pub ack_failures: usize,
}

impl BatchReport {
    fn tally(&mut self, handled: Handled) {
        match handled.disposition {
            Disposition::Applied => self.applied += 1,
            Disposition::Duplicate => self.duplicates += 1,
            Disposition::Discarded => self.discarded += 1,
            Disposition::Retained => self.retained += 1,
        }
        if handled.disposition.should_ack() && !handled.acked {
            self.ack_failures += 1;
        }
    }
}

/// The worker loop.
pub struct Worker {
    store: Arc<dyn RequestStore>,
    queue: Arc<dyn EventQueue>,
    config: WorkerConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Clone for Worker {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn RequestStore>,
        queue: Arc<dyn EventQueue>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            queue,
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Signal the worker to stop. No new receive is issued afterwards; a
    /// batch already received is processed to the end.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run until [`Worker::shutdown`] is called. Receive failures are logged
    /// and retried after the backoff.
    pub async fn run(&self) {
        let mut stop = self.shutdown.subscribe();
        info!(
            batch = self.config.receive.max_messages,
            wait_seconds = self.config.receive.wait_seconds,
            visibility_timeout = self.config.receive.visibility_timeout,
            "worker started"
        );

        loop {
            if *stop.borrow_and_update() {
                break;
            }

            let received = tokio::select! {
                _ = stop.changed() => break,
                received = self.queue.receive_batch(self.config.receive) => received,
            };

            match received {
                Ok(batch) => {
                    let report = self.process_batch(batch).await;
                    if report.received > 0 {
                        info!(
                            received = report.received,
                            applied = report.applied,
                            duplicates = report.duplicates,
                            discarded = report.discarded,
                            retained = report.retained,
                            "batch processed"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %e, "receive failed");
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(self.config.receive_error_backoff) => {}
                    }
                }
            }
        }

        info!("worker stopped");
    }

    /// One receive followed by processing of whatever arrived.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let batch = self.queue.receive_batch(self.config.receive).await?;
        Ok(self.process_batch(batch).await)
    }

    async fn process_batch(&self, batch: Vec<Delivery>) -> BatchReport {
        let mut report = BatchReport {
            received: batch.len(),
            ..BatchReport::default()
        };
        for delivery in &batch {
            report.tally(self.process_delivery(delivery).await);
        }
        report
    }

    /// Parse, apply and acknowledge one delivery.
    pub async fn process_delivery(&self, delivery: &Delivery) -> Handled {
        let span = start_delivery_span(delivery.handle.0, delivery.receive_count);

        async {
            let disposition = match StatusChangedEvent::from_body(&delivery.body) {
                Err(e) => {
                    warn!(error = %e, body = %delivery.body, "discarding malformed message");
                    Disposition::Discarded
                }
                Ok(event) => {
                    record_event(
                        &span,
                        &event.event_id.to_string(),
                        &event.request_id.to_string(),
                    );
                    self.apply(&event).await
                }
            };

            let acked = if disposition.should_ack() {
                self.acknowledge(delivery.handle).await
            } else {
                false
            };

            record_disposition(&span, disposition.as_str());
            metrics::worker_deliveries().add(
                1,
                &[KeyValue::new("disposition", disposition.as_str())],
            );
            Handled { disposition, acked }
        }
        .instrument(span.clone())
        .await
    }

    async fn apply(&self, event: &StatusChangedEvent) -> Disposition {
        match self.store.apply_event_idempotent(event, Utc::now()).await {
            Ok(ApplyOutcome::Applied) => {
                info!(
                    event_id = %event.event_id,
                    request_id = %event.request_id,
                    new_status = %event.new_status,
                    "event applied"
                );
                Disposition::Applied
            }
            Ok(ApplyOutcome::AlreadyApplied) => {
                info!(
                    event_id = %event.event_id,
                    request_id = %event.request_id,
                    "event already applied or request missing"
                );
                Disposition::Duplicate
            }
            Err(e) => {
                // Not deleted: the visibility timeout brings it back.
                error!(
                    event_id = %event.event_id,
                    request_id = %event.request_id,
                    error = %e,
                    "apply failed, leaving message for redelivery"
                );
                Disposition::Retained
            }
        }
    }

    /// Delete failures are logged only; the worst case is a redundant redelivery.
    async fn acknowledge(&self, handle: AckHandle) -> bool {
        match self.queue.delete(handle).await {
            Ok(()) => true,
            Err(e) => {
                warn!(handle = %handle, error = %e, "delete failed");
                false
            }
        }
    }
}
