//! Metric instrument factories for reqtrack.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"reqtrack"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for reqtrack instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("reqtrack")
}

/// Counter: requests created through the API.
pub fn requests_created() -> Counter<u64> {
    meter()
        .u64_counter("reqtrack.requests.created")
        .with_description("Number of requests created")
        .build()
}

/// Counter: admin status transitions.
/// Labels: `status`, `result` ("ok" | "not_found" | "enqueue_failed" | "error").
pub fn status_transitions() -> Counter<u64> {
    meter()
        .u64_counter("reqtrack.status.transitions")
        .with_description("Number of admin status transitions")
        .build()
}

/// Counter: queue-level operations (create, send, read, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("reqtrack.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: conditional store writes.
/// Labels: `operation`, `applied`.
pub fn store_conditional_writes() -> Counter<u64> {
    meter()
        .u64_counter("reqtrack.store.conditional_writes")
        .with_description("Number of conditional store writes")
        .build()
}

/// Counter: deliveries handled by the worker.
/// Labels: `disposition` ("applied" | "duplicate" | "discarded" | "retained").
pub fn worker_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("reqtrack.worker.deliveries")
        .with_description("Number of queue deliveries handled by the worker")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("reqtrack.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
