//! Metric instrument factories for taskq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider these are no-ops.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: tasks accepted by `submit`.
/// Labels: `priority`.
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: blocking executions left running after their deadline.
pub fn tasks_abandoned() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.abandoned")
        .with_description("Timed-out blocking executions abandoned")
        .build()
}

/// Histogram: execution time of one attempt.
/// Labels: `mode`, `outcome` ("ok" | "error" | "timeout").
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.task.duration_ms")
        .with_description("Task attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Gauge: tasks waiting in the queue.
/// Labels: `priority`.
pub fn queue_depth() -> Gauge<u64> {
    meter()
        .u64_gauge("taskq.queue.depth")
        .with_description("Tasks waiting in the queue")
        .build()
}

/// Gauge: tasks currently executing.
pub fn tasks_running() -> Gauge<u64> {
    meter()
        .u64_gauge("taskq.tasks.running")
        .with_description("Tasks currently executing")
        .build()
}

/// Gauge: completed-plus-failed tasks per second over the last window.
pub fn throughput() -> Gauge<f64> {
    meter()
        .f64_gauge("taskq.tasks.throughput")
        .with_description("Finished tasks per second")
        .with_unit("1/s")
        .build()
}
