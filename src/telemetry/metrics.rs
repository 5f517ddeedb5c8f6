//! Metric instrument factories.
//!
//! All instruments come from the `"taskstream"` meter on the globally
//! registered `MeterProvider`. Without an OTLP endpoint they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskstream")
}

/// Counter: tasks appended to the log.
/// Labels: `name`, `result` ("ok" | "error").
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("taskstream.tasks.enqueued")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: task status transitions observed by pool workers.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskstream.tasks.state_transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: broker stream commands (append, read_group, ack, ...).
/// Labels: `stream`, `operation`.
pub fn stream_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskstream.stream.operations")
        .with_description("Number of stream operations")
        .build()
}

/// Counter: claimed entries that could not be decoded into a task.
/// Labels: `reason`.
pub fn invalid_entries() -> Counter<u64> {
    meter()
        .u64_counter("taskstream.entries.invalid")
        .with_description("Claimed log entries that failed to decode")
        .build()
}

/// Counter: status events published.
/// Labels: `status`.
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("taskstream.events.published")
        .with_description("Number of status events published")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `name`, `outcome` ("completed" | "failed").
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskstream.task.duration_ms")
        .with_description("Task handler execution time in milliseconds")
        .with_unit("ms")
        .build()
}
