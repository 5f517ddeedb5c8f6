//! Tests for telemetry initialization, span helpers and instruments.

use opentelemetry::KeyValue;
use taskstream::broker::EntryId;
use taskstream::model::TaskId;
use taskstream::telemetry::{TelemetryConfig, init_telemetry, metrics, task};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be installed once per process, so a
    // second init in the same test binary may fail. Either way it must not
    // panic, and a successful guard is stderr-only.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "taskstream-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn task_span_records_transition() {
    let span = task::start_task_span("ExampleTask", &TaskId::generate(), EntryId(1), "worker-1");
    task::record_state_transition(&span, "pending", "running");
    task::record_state_transition(&span, "running", "completed");
}

#[test]
fn instruments_work_without_provider() {
    metrics::tasks_enqueued().add(1, &[KeyValue::new("result", "ok")]);
    metrics::task_state_transitions().add(
        1,
        &[KeyValue::new("from", "pending"), KeyValue::new("to", "running")],
    );
    metrics::stream_operations().add(1, &[KeyValue::new("operation", "append")]);
    metrics::invalid_entries().add(1, &[KeyValue::new("reason", "shape")]);
    metrics::events_published().add(1, &[KeyValue::new("status", "pending")]);
    metrics::task_duration_ms().record(12.5, &[KeyValue::new("outcome", "completed")]);
}
