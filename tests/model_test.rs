use std::time::Duration;

use taskq::error::TaskError;
use taskq::{Priority, RetryPolicy, TaskStatus};

#[test]
fn priorities_order_low_to_critical() {
    assert!(Priority::Critical > Priority::High);
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert_eq!(Priority::default(), Priority::Normal);
    assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
    assert!("urgent".parse::<Priority>().is_err());
}

#[test]
fn lifecycle_allows_only_forward_transitions() {
    use TaskStatus::*;
    assert!(Pending.can_transition_to(Running));
    assert!(Pending.can_transition_to(Cancelled));
    assert!(Running.can_transition_to(Retrying));
    assert!(Retrying.can_transition_to(Pending));

    assert!(!Running.can_transition_to(Cancelled));
    assert!(!Retrying.can_transition_to(Cancelled));
    assert!(!Pending.can_transition_to(Completed));
    for terminal in [Completed, Failed, Cancelled] {
        assert!(terminal.is_terminal());
        for to in [Pending, Running, Retrying, Completed, Failed, Cancelled] {
            assert!(!terminal.can_transition_to(to));
        }
    }
}

#[test]
fn retry_delay_grows_and_caps() {
    let policy = RetryPolicy {
        max_retries: 5,
        retry_delay: Duration::from_millis(100),
        multiplier: 2.0,
        max_delay: Some(Duration::from_millis(300)),
    };
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    assert_eq!(policy.delay_for(10), Duration::from_millis(300));

    let fixed = RetryPolicy::default();
    assert_eq!(fixed.delay_for(1), fixed.delay_for(4));
    assert_eq!(fixed.delay_for(1), Duration::from_secs(1));
}

#[test]
fn task_error_serializes_with_kind_tag() {
    let json = serde_json::to_value(TaskError::Timeout { timeout_ms: 50 }).unwrap();
    assert_eq!(json, serde_json::json!({ "kind": "timeout", "timeout_ms": 50 }));
    assert!(TaskError::Timeout { timeout_ms: 50 }.is_timeout());
    assert!(!TaskError::execution("x").is_timeout());
}
