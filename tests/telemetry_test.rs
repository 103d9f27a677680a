//! Integration tests for telemetry initialization and span helpers.

use taskq::model::{Priority, TaskId, TaskStatus};
use taskq::telemetry::task::{record_outcome, record_state_transition, start_task_span};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Only one global subscriber per process; a second init may fail and
    // that is fine here.
    let config = taskq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "taskq-test".to_string(),
        default_filter: "info".to_string(),
    };
    if let Ok(guard) = taskq::telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn task_span_records_outcome_and_transitions() {
    let span = start_task_span(TaskId::new(), Priority::High, 2, 0);
    record_state_transition(&span, TaskStatus::Pending, TaskStatus::Running);
    record_outcome(&span, "ok");
    record_state_transition(&span, TaskStatus::Running, TaskStatus::Completed);
}

#[test]
fn metric_instruments_are_usable_without_a_provider() {
    use opentelemetry::KeyValue;
    use taskq::telemetry::metrics;

    metrics::tasks_submitted().add(1, &[KeyValue::new("priority", "normal")]);
    metrics::task_duration_ms().record(12.5, &[KeyValue::new("outcome", "ok")]);
    metrics::queue_depth().record(3, &[KeyValue::new("priority", "low")]);
    metrics::throughput().record(0.5, &[]);
}
