//! Metric instrument factories for jobsync.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobsync"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobsync instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobsync")
}

/// Counter: inbound broker messages by how they were settled.
/// Labels: `outcome` ("acked" | "nacked" | "dead_lettered").
pub fn messages() -> Counter<u64> {
    meter()
        .u64_counter("jobsync.ingest.messages")
        .with_description("Status messages settled with the broker")
        .build()
}

/// Counter: status updates by result.
/// Labels: `outcome` ("applied" | "unresolved" | "out_of_order" | "terminal" | "invalid_transition").
pub fn job_updates() -> Counter<u64> {
    meter()
        .u64_counter("jobsync.job.updates")
        .with_description("Status updates offered to the entity store")
        .build()
}

/// Counter: tracked job status transitions.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobsync.job.state_transitions")
        .with_description("Number of tracked job status transitions")
        .build()
}

/// Counter: queue-level operations (create, send, read, set_vt, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("jobsync.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: per-connection broadcast results.
/// Labels: `result` ("sent" | "dropped" | "closed").
pub fn broadcasts() -> Counter<u64> {
    meter()
        .u64_counter("jobsync.gateway.broadcasts")
        .with_description("Broadcast deliveries attempted per observer connection")
        .build()
}

/// Counter: overdue jobs handled by the stale loop.
/// Labels: `outcome` ("refreshed" | "reconciled" | "retried" | "exhausted" | "unreachable").
pub fn stale_jobs() -> Counter<u64> {
    meter()
        .u64_counter("jobsync.stale.jobs")
        .with_description("Overdue jobs examined by the stale loop")
        .build()
}

/// Counter: retry controller decisions.
/// Labels: `result` ("scheduled" | "exhausted" | "manual").
pub fn retries() -> Counter<u64> {
    meter()
        .u64_counter("jobsync.retry.decisions")
        .with_description("Retry scheduling decisions")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobsync.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
