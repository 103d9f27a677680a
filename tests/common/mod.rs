//! Shared helpers for dispatcher integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskq::{
    Dispatcher, DispatcherConfig, Priority, RetryPolicy, TaskId, TaskRecord, TaskRequest, TaskStatus,
};
use tokio::sync::Notify;

/// One worker, one blocking thread, no retries unless a test asks.
pub fn single_worker() -> DispatcherConfig {
    DispatcherConfig {
        workers: 1,
        blocking_threads: 1,
        default_retry: RetryPolicy::none(),
        ..DispatcherConfig::default()
    }
}

pub async fn wait_until<F>(what: &str, mut done: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

pub async fn wait_terminal(dispatcher: &Dispatcher, id: TaskId) -> TaskRecord {
    wait_until("task to finish", || {
        dispatcher.get_status(id).unwrap().status.is_terminal()
    })
    .await;
    dispatcher.get_status(id).unwrap()
}

pub async fn wait_status(dispatcher: &Dispatcher, id: TaskId, status: TaskStatus) {
    wait_until(&format!("task to reach {status}"), || {
        dispatcher.get_status(id).unwrap().status == status
    })
    .await;
}

/// Occupy a worker with a task that runs until the returned handle is
/// notified. Returns once the task is running.
pub async fn hold_worker(dispatcher: &Dispatcher) -> (TaskId, Arc<Notify>) {
    let gate = Arc::new(Notify::new());
    let held = Arc::clone(&gate);
    let id = dispatcher
        .submit(
            TaskRequest::lightweight(move |_ctx| {
                let gate = Arc::clone(&held);
                async move {
                    gate.notified().await;
                    Ok(serde_json::Value::Null)
                }
            })
            .label("gate")
            .priority(Priority::Critical),
        )
        .unwrap();
    wait_status(dispatcher, id, TaskStatus::Running).await;
    (id, gate)
}

pub type Order = Arc<Mutex<Vec<String>>>;

/// A task that appends `name` to `order` when it runs.
pub fn recorder(order: &Order, name: &str) -> TaskRequest {
    let order = Arc::clone(order);
    let label = name.to_string();
    let name = label.clone();
    TaskRequest::lightweight(move |_ctx| {
        order.lock().unwrap().push(name.clone());
        async { Ok(serde_json::Value::Null) }
    })
    .label(label)
}

pub fn noop() -> TaskRequest {
    TaskRequest::lightweight(|_ctx| async { Ok(serde_json::Value::Null) })
}
