//! Task execution span helpers.

use tracing::Span;

use crate::broker::EntryId;
use crate::model::TaskId;

/// Start a span covering one delivery of a task to a pool worker.
///
/// `task.status` is declared empty and filled by
/// [`record_state_transition`].
pub fn start_task_span(name: &str, task_id: &TaskId, entry_id: EntryId, worker: &str) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.name" = name,
        "task.id" = %task_id,
        "entry.id" = %entry_id,
        "worker" = worker,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a status transition on the span and emit it as an event.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
