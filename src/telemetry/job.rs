//! Message handling span helpers.

use tracing::Span;

/// Start a span for handling one broker delivery.
///
/// `job.entity_id` and `job.outcome` are declared empty and filled in as
/// the handler learns them.
pub fn start_message_span(msg_id: i64, attempt: i32) -> Span {
    tracing::info_span!(
        "job.status_message",
        "message.id" = msg_id,
        "message.attempt" = attempt,
        "job.entity_id" = tracing::field::Empty,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record how the delivery was settled.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
}

/// Record a status transition event on the given span.
pub fn record_status_transition(span: &Span, entity_id: &str, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(entity_id, from, to, "status_transition");
    });
}
