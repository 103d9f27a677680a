//! Integration tests for the health monitor.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::*;
use taskq::clock::ManualClock;
use taskq::monitor::{MetricsSink, Monitor, MonitorConfig, MonitorSample, MonitorWarning};
use taskq::queue::PriorityQueue;
use taskq::store::StatusStore;
use taskq::{Dispatcher, Priority, TaskId, TaskRecord, TaskStatus};
use tokio::sync::watch;

#[derive(Default)]
struct Probe {
    samples: Mutex<Vec<MonitorSample>>,
}

impl MetricsSink for Probe {
    fn record(&self, sample: &MonitorSample) {
        self.samples.lock().unwrap().push(sample.clone());
    }
}

fn quiet_config() -> MonitorConfig {
    MonitorConfig {
        interval: Duration::from_secs(1),
        window: 2,
        queue_depth_warn: None,
        running_warn: None,
    }
}

fn completed(start: DateTime<Utc>, execution_ms: i64) -> TaskRecord {
    TaskRecord {
        id: TaskId::new(),
        label: None,
        priority: Priority::Normal,
        status: TaskStatus::Completed,
        dependencies: Vec::new(),
        max_retries: 0,
        retry_count: 0,
        result: None,
        error: None,
        last_error: None,
        created_at: start,
        started_at: Some(start),
        completed_at: Some(start + chrono::Duration::milliseconds(execution_ms)),
    }
}

#[test]
fn sample_computes_windowed_average_and_throughput() {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(StatusStore::new());
    let probe = Arc::new(Probe::default());
    let mut monitor = Monitor::new(
        Arc::new(PriorityQueue::unbounded()),
        Arc::clone(&store),
        clock.clone(),
        quiet_config(),
        probe.clone(),
    );
    let t0 = DateTime::UNIX_EPOCH;

    store.set(completed(t0, 100));
    store.set(completed(t0, 300));
    clock.advance(Duration::from_secs(2));
    let first = monitor.sample();
    assert_eq!(first.completed, 2);
    assert_eq!(first.avg_execution_ms, 200.0);
    assert_eq!(first.throughput_per_second, 1.0);

    store.set(completed(t0, 400));
    clock.advance(Duration::from_secs(1));
    let second = monitor.sample();
    assert_eq!(second.completed, 3);
    assert!((second.avg_execution_ms - 800.0 / 3.0).abs() < 1e-9);
    assert_eq!(second.throughput_per_second, 1.0);

    // The first sample has left the two-sample window.
    clock.advance(Duration::from_secs(1));
    let third = monitor.sample();
    assert_eq!(third.avg_execution_ms, 400.0);
    assert_eq!(third.throughput_per_second, 0.0);

    assert_eq!(probe.samples.lock().unwrap().len(), 3);
}

#[test]
fn empty_system_samples_zeroes() {
    let clock = Arc::new(ManualClock::default());
    let mut monitor = Monitor::new(
        Arc::new(PriorityQueue::unbounded()),
        Arc::new(StatusStore::new()),
        clock.clone(),
        quiet_config(),
        Arc::new(Probe::default()),
    );

    let sample = monitor.sample();
    assert_eq!(sample.queue_total(), 0);
    assert_eq!(sample.queue_depth.len(), Priority::ALL.len());
    assert_eq!(sample.pending, 0);
    assert_eq!(sample.avg_execution_ms, 0.0);
    assert_eq!(sample.throughput_per_second, 0.0);
    assert!(sample.warnings.is_empty());
}

#[tokio::test]
async fn thresholds_raise_warnings_without_touching_tasks() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = Arc::new(PriorityQueue::unbounded());
    let store = Arc::new(StatusStore::new());
    let dispatcher = Dispatcher::with_parts(
        single_worker(),
        Arc::clone(&queue),
        Arc::clone(&store),
        clock.clone(),
    )
    .unwrap();
    let mut monitor = dispatcher.monitor(
        MonitorConfig {
            queue_depth_warn: Some(2),
            running_warn: Some(1),
            ..quiet_config()
        },
        Arc::new(Probe::default()),
    );

    let (gate_id, gate) = hold_worker(&dispatcher).await;
    let queued = [
        dispatcher.submit(noop()).unwrap(),
        dispatcher.submit(noop().priority(Priority::High)).unwrap(),
    ];
    let before: Vec<TaskRecord> = queued
        .iter()
        .map(|id| dispatcher.get_status(*id).unwrap())
        .collect();

    let sample = monitor.sample();
    assert_eq!(sample.queue_total(), 2);
    assert_eq!(sample.queue_depth[&Priority::Normal], 1);
    assert_eq!(sample.queue_depth[&Priority::High], 1);
    assert_eq!(sample.pending, 2);
    assert_eq!(sample.running, 1);
    assert_eq!(
        sample.warnings,
        [
            MonitorWarning::QueueDepth {
                depth: 2,
                threshold: 2
            },
            MonitorWarning::Running {
                running: 1,
                threshold: 1
            },
        ]
    );

    // Sampling is read-only.
    assert_eq!(queue.len(), 2);
    let after: Vec<TaskRecord> = queued
        .iter()
        .map(|id| dispatcher.get_status(*id).unwrap())
        .collect();
    assert_eq!(before, after);

    gate.notify_one();
    wait_terminal(&dispatcher, gate_id).await;
    for id in queued {
        wait_terminal(&dispatcher, id).await;
    }
    let sample = monitor.sample();
    assert!(sample.warnings.is_empty());
    assert_eq!(sample.completed, 3);
}

#[tokio::test]
async fn run_samples_until_shutdown() {
    let dispatcher = Dispatcher::start(single_worker()).unwrap();
    let probe = Arc::new(Probe::default());
    let monitor = dispatcher.monitor(
        MonitorConfig {
            interval: Duration::from_millis(10),
            ..quiet_config()
        },
        probe.clone(),
    );

    let (stop, stopped) = watch::channel(false);
    let handle = tokio::spawn(monitor.run(stopped));
    wait_until("two samples", || probe.samples.lock().unwrap().len() >= 2).await;

    stop.send_replace(true);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("monitor did not stop")
        .unwrap();
}
