//! The dispatcher: owns the queue, the status store, and the worker pool,
//! and exposes the submit / status / cancel / stats contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::{Id, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result, TaskError};
use crate::event::{Event, EventBus, EventKind};
use crate::model::{DispatcherStats, RetryPolicy, TaskId, TaskRecord, TaskStatus};
use crate::monitor::{MetricsSink, Monitor, MonitorConfig};
use crate::queue::PriorityQueue;
use crate::request::{Task, TaskRequest};
use crate::store::StatusStore;
use crate::telemetry::metrics;

use super::waitlist::Waitlist;
use super::worker;

/// Configuration for a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Concurrent worker loops.
    pub workers: usize,
    /// Size of the bounded executor for blocking work, independent of
    /// `workers`.
    pub blocking_threads: usize,
    /// Bound on waiting tasks; `None` is unbounded.
    pub queue_capacity: Option<usize>,
    /// Deadline for tasks submitted without one.
    pub default_timeout: Duration,
    /// Retry policy for tasks submitted without one.
    pub default_retry: RetryPolicy,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            blocking_threads: 2,
            queue_capacity: None,
            default_timeout: Duration::from_secs(30),
            default_retry: RetryPolicy::default(),
            event_capacity: 1024,
        }
    }
}

impl From<&Config> for DispatcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.dispatcher.workers,
            blocking_threads: config.dispatcher.blocking_threads,
            queue_capacity: config.dispatcher.queue_capacity,
            default_timeout: Duration::from_millis(config.dispatcher.default_timeout_ms),
            default_retry: RetryPolicy::from(&config.retry),
            event_capacity: config.dispatcher.event_capacity,
        }
    }
}

/// State shared by the dispatcher handle, its workers, and retry timers.
pub(crate) struct Shared {
    pub(crate) queue: Arc<PriorityQueue>,
    pub(crate) store: Arc<StatusStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) waitlist: Waitlist,
    pub(crate) events: EventBus,
    /// Permits for the blocking executor.
    pub(crate) blocking: Arc<Semaphore>,
    pub(crate) abandoned: AtomicU64,
    /// Task each worker is executing, by worker index.
    in_flight: Mutex<HashMap<usize, TaskId>>,
    pub(crate) config: DispatcherConfig,
    started_at: DateTime<Utc>,
}

impl Shared {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<usize, TaskId>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that `worker` is about to run `id`.
    pub(crate) fn track(&self, worker: usize, id: TaskId) {
        self.in_flight().insert(worker, id);
    }

    pub(crate) fn untrack(&self, worker: usize) {
        self.in_flight().remove(&worker);
    }

    /// Fail the task a dead worker left behind, if it was still running.
    fn fail_stranded(&self, worker: usize) {
        let Some(id) = self.in_flight().remove(&worker) else {
            return;
        };
        let error = TaskError::execution("worker died");
        let now = self.clock.now();
        let failed = self.store.transition(id, TaskStatus::Failed, |record| {
            record.error = Some(error.clone());
            record.last_error = Some(error.clone());
            record.completed_at = Some(now);
        });
        let record = match failed {
            Ok(record) => record,
            Err(e) => {
                debug!(task_id = %id, worker, error = %e, "no stranded task to fail");
                return;
            }
        };

        metrics::state_transitions().add(
            1,
            &[
                KeyValue::new("from", TaskStatus::Running.to_string()),
                KeyValue::new("to", TaskStatus::Failed.to_string()),
            ],
        );
        error!(task_id = %id, worker, "worker died mid-task, task failed");
        self.emit(EventKind::TaskFailed {
            id,
            attempts: record.retry_count + 1,
            error,
        });
        self.release_dependents(id);
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        self.events.emit(self.clock.now(), kind);
    }

    /// Return tasks parked on `id` to the queue. Call after `id` reached a
    /// terminal state in the store.
    pub(crate) fn release_dependents(&self, id: TaskId) {
        for task in self.waitlist.release(id) {
            debug!(task_id = %task.id, dependency = %id, "dependency finished, requeueing");
            self.queue.requeue(task);
        }
    }

    /// Move a pending task to cancelled, recording `reason`.
    pub(crate) fn cancel_pending(&self, id: TaskId, reason: TaskError) -> bool {
        let now = self.clock.now();
        let cancelled = self.store.transition(id, TaskStatus::Cancelled, |record| {
            record.error = Some(reason.clone());
            record.completed_at = Some(now);
        });
        if cancelled.is_err() {
            return false;
        }

        self.queue.remove(id);
        self.waitlist.remove(id);
        metrics::state_transitions().add(
            1,
            &[
                KeyValue::new("from", TaskStatus::Pending.to_string()),
                KeyValue::new("to", TaskStatus::Cancelled.to_string()),
            ],
        );
        info!(task_id = %id, reason = %reason, "task cancelled");
        self.emit(EventKind::TaskCancelled { id, reason });
        self.release_dependents(id);
        true
    }
}

/// Priority task dispatcher with a fixed pool of workers.
///
/// Each instance is independent; several can run in one process.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Dispatcher {
    /// Start a dispatcher with a fresh queue and store on the current tokio
    /// runtime.
    pub fn start(config: DispatcherConfig) -> Result<Self> {
        let queue = match config.queue_capacity {
            Some(cap) => PriorityQueue::bounded(cap),
            None => PriorityQueue::unbounded(),
        };
        Self::with_parts(
            config,
            Arc::new(queue),
            Arc::new(StatusStore::new()),
            Arc::new(SystemClock),
        )
    }

    /// Start a dispatcher on injected parts.
    pub fn with_parts(
        config: DispatcherConfig,
        queue: Arc<PriorityQueue>,
        store: Arc<StatusStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.workers == 0 || config.blocking_threads == 0 {
            return Err(Error::Config(
                "workers and blocking_threads must be at least 1".into(),
            ));
        }
        if config.default_timeout.is_zero() {
            return Err(Error::Config("default timeout must be non-zero".into()));
        }
        config.default_retry.validate()?;

        let shared = Arc::new(Shared {
            queue,
            store,
            waitlist: Waitlist::default(),
            events: EventBus::new(config.event_capacity),
            blocking: Arc::new(Semaphore::new(config.blocking_threads)),
            abandoned: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
            started_at: clock.now(),
            clock,
            config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        let mut indices = HashMap::new();
        for index in 0..shared.config.workers {
            let handle = workers.spawn(worker::run(Arc::clone(&shared), index, shutdown_rx.clone()));
            indices.insert(handle.id(), index);
        }
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&shared),
            workers,
            indices,
            shutdown_rx,
        ));

        info!(
            workers = shared.config.workers,
            blocking_threads = shared.config.blocking_threads,
            queue_capacity = ?shared.config.queue_capacity,
            "dispatcher started"
        );

        Ok(Self {
            shared,
            shutdown: Arc::new(shutdown_tx),
            supervisor: Arc::new(Mutex::new(Some(supervisor))),
        })
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Validate the request and record the task as pending.
    fn admit(&self, request: TaskRequest) -> Result<Arc<Task>> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let config = &self.shared.config;
        let task = request.into_task(TaskId::new(), &config.default_retry, config.default_timeout)?;
        if let Some(missing) = task
            .dependencies
            .iter()
            .find(|dep| !self.shared.store.contains(**dep))
        {
            return Err(Error::UnknownDependency(*missing));
        }

        self.shared.store.set(TaskRecord {
            id: task.id,
            label: task.label.clone(),
            priority: task.priority,
            status: TaskStatus::Pending,
            dependencies: task.dependencies.clone(),
            max_retries: task.retry.max_retries,
            retry_count: 0,
            result: None,
            error: None,
            last_error: None,
            created_at: self.shared.clock.now(),
            started_at: None,
            completed_at: None,
        });
        Ok(Arc::new(task))
    }

    /// Emit the submission event. Runs under the queue lock, so it is
    /// sequenced before any event from a worker that takes the task.
    fn emit_submitted(&self, task: &Task) {
        self.shared.emit(EventKind::TaskSubmitted {
            id: task.id,
            label: task.label.clone(),
            priority: task.priority,
            mode: task.work.mode(),
        });
    }

    fn announce(&self, task: &Task) {
        metrics::tasks_submitted().add(1, &[KeyValue::new("priority", task.priority.to_string())]);
        info!(
            task_id = %task.id,
            name = %task.name(),
            priority = %task.priority,
            mode = %task.work.mode(),
            dependencies = task.dependencies.len(),
            "task submitted"
        );
    }

    /// Submit a task and return its id without waiting for it to run.
    ///
    /// With a bounded queue at capacity this fails with
    /// [`Error::QueueFull`]; use [`Dispatcher::submit_wait`] to wait instead.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        let task = self.admit(request)?;
        let id = task.id;
        let queued = self
            .shared
            .queue
            .put_then(Arc::clone(&task), || self.emit_submitted(&task));
        if let Err(e) = queued {
            self.shared.store.remove(id);
            warn!(task_id = %id, error = %e, "task rejected");
            return Err(e);
        }
        self.announce(&task);
        Ok(id)
    }

    /// Submit a task, waiting for queue capacity in bounded mode.
    pub async fn submit_wait(&self, request: TaskRequest) -> Result<TaskId> {
        let task = self.admit(request)?;
        let id = task.id;
        self.shared
            .queue
            .put_wait_then(Arc::clone(&task), || self.emit_submitted(&task))
            .await;
        self.announce(&task);
        Ok(id)
    }

    pub fn get_status(&self, id: TaskId) -> Result<TaskRecord> {
        self.shared.store.get(id).ok_or(Error::NotFound(id))
    }

    /// Cancel a pending task. Returns false for unknown, running, retrying,
    /// or finished tasks, leaving them untouched.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.shared
            .cancel_pending(id, TaskError::CancellationRequested)
    }

    pub fn get_stats(&self) -> DispatcherStats {
        let summary = self.shared.store.summary();
        let elapsed = (self.shared.clock.now() - self.shared.started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        let throughput_per_second = if elapsed > 0.0 {
            summary.finished() as f64 / elapsed
        } else {
            0.0
        };

        DispatcherStats {
            running: summary.running,
            retrying: summary.retrying,
            completed: summary.completed,
            failed: summary.failed,
            cancelled: summary.cancelled,
            abandoned: self.shared.abandoned.load(Ordering::Relaxed),
            avg_execution_ms: summary
                .avg_execution()
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
            throughput_per_second,
            pending_by_priority: summary.pending_by_priority,
        }
    }

    /// Subscribe to lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// A monitor reading this dispatcher's queue and store.
    pub fn monitor(&self, config: MonitorConfig, sink: Arc<dyn MetricsSink>) -> Monitor {
        Monitor::new(
            Arc::clone(&self.shared.queue),
            Arc::clone(&self.shared.store),
            Arc::clone(&self.shared.clock),
            config,
            sink,
        )
    }

    /// Tasks waiting on a dependency rather than in the queue.
    pub fn parked(&self) -> usize {
        self.shared.waitlist.len()
    }

    /// Stop accepting work and wait for workers to finish their current
    /// task. Queued tasks stay pending.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!(error = %e, "worker supervisor failed");
            }
            info!("dispatcher stopped");
        }
    }
}

/// Keep the pool at full size: a worker that dies outside shutdown is
/// replaced, after its in-flight task is failed.
async fn supervise(
    shared: Arc<Shared>,
    mut workers: JoinSet<()>,
    mut indices: HashMap<Id, usize>,
    shutdown: watch::Receiver<bool>,
) {
    let mut next_index = shared.config.workers;
    while let Some(joined) = workers.join_next_with_id().await {
        let id = match &joined {
            Ok((id, ())) => *id,
            Err(e) => e.id(),
        };
        let Some(index) = indices.remove(&id) else {
            continue;
        };
        shared.fail_stranded(index);

        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            continue;
        }
        match joined {
            Err(e) if e.is_panic() => {
                error!(worker = index, error = %e, "worker panicked, starting replacement")
            }
            _ => warn!(worker = index, "worker exited unexpectedly, starting replacement"),
        }
        let handle = workers.spawn(worker::run(
            Arc::clone(&shared),
            next_index,
            shutdown.clone(),
        ));
        indices.insert(handle.id(), next_index);
        next_index += 1;
    }
}
