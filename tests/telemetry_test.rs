//! Integration tests for telemetry initialization and span helpers.

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = jobsync::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "jobsync-test".to_string(),
        log_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let _guard = jobsync::telemetry::init_telemetry(config);
}

#[test]
fn message_span_records_outcome_and_transition() {
    let span = jobsync::telemetry::job::start_message_span(42, 1);
    span.record("job.entity_id", "v1");
    jobsync::telemetry::job::record_outcome(&span, "acked");
    jobsync::telemetry::job::record_status_transition(&span, "v1", "pending", "active");
}

#[test]
fn metric_instruments_are_usable_without_a_provider() {
    use opentelemetry::KeyValue;
    use jobsync::telemetry::metrics;

    metrics::messages().add(1, &[KeyValue::new("outcome", "acked")]);
    metrics::broadcasts().add(2, &[KeyValue::new("result", "sent")]);
    metrics::operation_duration_ms().record(1.5, &[KeyValue::new("operation", "stale.cycle")]);
}
