//! Status-changed event span helpers.
//!
//! One span per delivery handled by the worker. The `event.disposition`
//! field is declared empty and filled via [`record_disposition`].

use tracing::Span;

/// Start a span for handling one queue delivery.
///
/// Event and request ids are unknown until the body parses, so they are
/// declared empty too.
pub fn start_delivery_span(handle: i64, receive_count: i32) -> Span {
    tracing::info_span!(
        "event.handle",
        "queue.handle" = handle,
        "queue.receive_count" = receive_count,
        "event.id" = tracing::field::Empty,
        "event.request_id" = tracing::field::Empty,
        "event.disposition" = tracing::field::Empty,
    )
}

/// Record the parsed event's identity on the span.
pub fn record_event(span: &Span, event_id: &str, request_id: &str) {
    span.record("event.id", event_id);
    span.record("event.request_id", request_id);
}

/// Record what the worker did with the delivery.
pub fn record_disposition(span: &Span, disposition: &str) {
    span.record("event.disposition", disposition);
    span.in_scope(|| {
        tracing::debug!(disposition, "delivery handled");
    });
}
