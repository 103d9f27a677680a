//! Worker loop: take, check dependencies, execute under a deadline,
//! classify the outcome, then finish or schedule a retry.
//!
//! Errors, timeouts, and panics from the work are captured here and written
//! to the task record; nothing escapes the loop.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::TaskError;
use crate::event::EventKind;
use crate::model::TaskStatus;
use crate::request::Task;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_outcome, record_state_transition, start_task_span};
use crate::work::{TaskContext, Work, WorkResult};

use super::dispatcher::Shared;
use super::waitlist::Readiness;

pub(crate) async fn run(shared: Arc<Shared>, index: usize, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = index, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let task = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            task = shared.queue.take() => task,
        };
        process(&shared, index, task).await;
    }
    debug!(worker = index, "worker stopped");
}

async fn process(shared: &Arc<Shared>, worker: usize, task: Arc<Task>) {
    let id = task.id;
    match shared.store.status(id) {
        Some(TaskStatus::Pending) => {}
        status => {
            debug!(task_id = %id, ?status, "skipping task that is no longer pending");
            return;
        }
    }

    match shared.waitlist.check_or_park(&task, &shared.store) {
        Readiness::Ready => {}
        Readiness::Parked(dependency) => {
            debug!(task_id = %id, %dependency, "dependency not complete, parked");
            shared.emit(EventKind::TaskParked {
                id,
                waiting_on: dependency,
            });
            return;
        }
        Readiness::Unsatisfiable { dependency, reason } => {
            warn!(task_id = %id, %dependency, %reason, "dependency cannot complete");
            shared.cancel_pending(id, TaskError::DependencyUnsatisfied { dependency, reason });
            return;
        }
    }

    // Tracked before the write so a worker dying from here on leaves the
    // supervisor a task to fail.
    shared.track(worker, id);
    let now = shared.clock.now();
    let record = match shared
        .store
        .transition(id, TaskStatus::Running, |r| r.started_at = Some(now))
    {
        Ok(record) => record,
        Err(e) => {
            // Cancelled between take and start.
            shared.untrack(worker);
            debug!(task_id = %id, error = %e, "task not started");
            return;
        }
    };

    let attempt = record.retry_count + 1;
    let span = start_task_span(id, task.priority, attempt, worker);
    record_state_transition(&span, TaskStatus::Pending, TaskStatus::Running);
    shared.emit(EventKind::TaskDispatched {
        id,
        worker,
        attempt,
    });

    let ctx = TaskContext {
        task_id: id,
        attempt,
        priority: task.priority,
        timeout: task.timeout,
    };
    let started = Instant::now();
    let outcome = execute(shared, &task, ctx).instrument(span.clone()).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let outcome_label = match &outcome {
        Ok(_) => "ok",
        Err(e) if e.is_timeout() => "timeout",
        Err(_) => "error",
    };
    record_outcome(&span, outcome_label);
    metrics::task_duration_ms().record(
        elapsed_ms,
        &[
            KeyValue::new("mode", task.work.mode().to_string()),
            KeyValue::new("outcome", outcome_label),
        ],
    );

    span.in_scope(|| match outcome {
        Ok(value) => complete(shared, &task, value, elapsed_ms as u64, &span),
        Err(error) => fail_or_retry(shared, &task, error, &span),
    });
    shared.untrack(worker);
}

/// Roughly 30 years; stands in for deadlines past what `Instant` can hold.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Run one attempt under the task's deadline.
async fn execute(
    shared: &Shared,
    task: &Task,
    ctx: TaskContext,
) -> Result<serde_json::Value, TaskError> {
    let timeout_ms = u64::try_from(task.timeout.as_millis()).unwrap_or(u64::MAX);

    match &task.work {
        Work::Lightweight(work) => {
            let deadline = deadline_after(task.timeout);
            let work = Arc::clone(work);
            let mut handle = tokio::spawn(async move { work.execute(ctx).await });
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    handle.abort();
                    Err(TaskError::Timeout { timeout_ms })
                }
            }
        }
        Work::Blocking(work) => {
            let attempt = ctx.attempt;
            let Ok(permit) = Arc::clone(&shared.blocking).acquire_owned().await else {
                return Err(TaskError::execution("blocking executor closed"));
            };

            // The deadline covers execution only, not the wait for a thread.
            let deadline = deadline_after(task.timeout);
            let work = Arc::clone(work);
            let handle = tokio::task::spawn_blocking(move || work.execute(ctx));
            let joined = tokio::time::timeout_at(deadline, handle).await;
            // Either way the slot goes back: on timeout it is the
            // replacement for the abandoned thread.
            drop(permit);
            match joined {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    shared.abandoned.fetch_add(1, Ordering::Relaxed);
                    metrics::tasks_abandoned().add(1, &[]);
                    warn!(
                        task_id = %task.id,
                        attempt,
                        timeout_ms,
                        "blocking work missed its deadline, abandoning execution"
                    );
                    shared.emit(EventKind::ExecutionAbandoned {
                        id: task.id,
                        attempt,
                    });
                    Err(TaskError::Timeout { timeout_ms })
                }
            }
        }
    }
}

fn flatten(joined: Result<WorkResult, JoinError>) -> Result<serde_json::Value, TaskError> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::execution(format!("{e:#}"))),
        Err(e) if e.is_panic() => Err(TaskError::execution(format!(
            "work panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(TaskError::execution(format!("work aborted: {e}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn complete(
    shared: &Arc<Shared>,
    task: &Task,
    value: serde_json::Value,
    duration_ms: u64,
    span: &tracing::Span,
) {
    let now = shared.clock.now();
    let written = shared.store.transition(task.id, TaskStatus::Completed, |r| {
        r.result = Some(value);
        r.completed_at = Some(now);
    });
    if let Err(e) = written {
        error!(task_id = %task.id, error = %e, "failed to record completion");
        return;
    }

    record_state_transition(span, TaskStatus::Running, TaskStatus::Completed);
    info!(task_id = %task.id, name = %task.name(), duration_ms, "task completed");
    shared.emit(EventKind::TaskCompleted {
        id: task.id,
        duration_ms,
    });
    shared.release_dependents(task.id);
}

fn fail_or_retry(shared: &Arc<Shared>, task: &Arc<Task>, error: TaskError, span: &tracing::Span) {
    let Some(record) = shared.store.get(task.id) else {
        error!(task_id = %task.id, "running task missing from store");
        return;
    };

    if record.retry_count < task.retry.max_retries {
        let retry = record.retry_count + 1;
        let delay = task.retry.delay_for(retry);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let written = shared.store.transition(task.id, TaskStatus::Retrying, |r| {
            r.retry_count = retry;
            r.last_error = Some(error.clone());
        });
        if let Err(e) = written {
            error!(task_id = %task.id, error = %e, "failed to record retry");
            return;
        }

        record_state_transition(span, TaskStatus::Running, TaskStatus::Retrying);
        warn!(
            task_id = %task.id,
            name = %task.name(),
            retry,
            max_retries = task.retry.max_retries,
            delay_ms,
            %error,
            "task attempt failed, retrying"
        );
        shared.emit(EventKind::TaskRetrying {
            id: task.id,
            attempt: retry,
            delay_ms,
            error,
        });

        // The delay runs on its own timer so the worker is free meanwhile.
        let shared = Arc::clone(shared);
        let task = Arc::clone(task);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            requeue_for_retry(&shared, task);
        });
    } else {
        let now = shared.clock.now();
        let attempts = record.retry_count + 1;
        let written = shared.store.transition(task.id, TaskStatus::Failed, |r| {
            r.error = Some(error.clone());
            r.last_error = Some(error.clone());
            r.completed_at = Some(now);
        });
        if let Err(e) = written {
            error!(task_id = %task.id, error = %e, "failed to record failure");
            return;
        }

        record_state_transition(span, TaskStatus::Running, TaskStatus::Failed);
        error!(task_id = %task.id, name = %task.name(), attempts, %error, "task failed");
        shared.emit(EventKind::TaskFailed {
            id: task.id,
            attempts,
            error,
        });
        shared.release_dependents(task.id);
    }
}

fn requeue_for_retry(shared: &Shared, task: Arc<Task>) {
    match shared
        .store
        .transition(task.id, TaskStatus::Pending, |_| {})
    {
        Ok(_) => {
            debug!(task_id = %task.id, "retry delay elapsed, requeueing");
            shared.queue.requeue(task);
        }
        Err(e) => error!(task_id = %task.id, error = %e, "failed to requeue for retry"),
    }
}
