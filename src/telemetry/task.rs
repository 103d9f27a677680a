//! Task execution span helpers.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::{Priority, TaskId, TaskStatus};

/// Start a span covering one execution attempt.
///
/// `task.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_task_span(id: TaskId, priority: Priority, attempt: u32, worker: usize) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.id" = %id,
        "task.priority" = %priority,
        "task.attempt" = attempt,
        "task.worker" = worker,
        "task.outcome" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("task.outcome", outcome);
}

/// Emit a state transition event inside `span` and count it.
pub fn record_state_transition(span: &Span, from: TaskStatus, to: TaskStatus) {
    span.in_scope(|| {
        tracing::debug!(from = %from, to = %to, "state_transition");
    });
    super::metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
