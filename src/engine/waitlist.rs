//! Dependency wakeup list.
//!
//! A task whose dependencies are not all completed is parked here, keyed by
//! the first unmet dependency, instead of going back to the queue. When that
//! dependency reaches a terminal state its parked tasks are released to the
//! queue and checked again.
//!
//! Checking and parking happen under the waitlist lock. Finishing a task
//! writes the store first and releases second, so a check either sees the
//! terminal status or parks before the release and is picked up by it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::{TaskId, TaskStatus};
use crate::request::Task;
use crate::store::StatusStore;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Every dependency is completed.
    Ready,
    /// Parked until this dependency finishes.
    Parked(TaskId),
    /// This dependency can never complete.
    Unsatisfiable { dependency: TaskId, reason: String },
}

#[derive(Default)]
pub(crate) struct Waitlist {
    parked: Mutex<HashMap<TaskId, Vec<Arc<Task>>>>,
}

impl Waitlist {
    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Vec<Arc<Task>>>> {
        self.parked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn check_or_park(&self, task: &Arc<Task>, store: &StatusStore) -> Readiness {
        let mut parked = self.lock();
        for &dependency in &task.dependencies {
            match store.status(dependency) {
                Some(TaskStatus::Completed) => continue,
                Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                    return Readiness::Unsatisfiable {
                        dependency,
                        reason: status.to_string(),
                    };
                }
                Some(_) => {
                    parked.entry(dependency).or_default().push(Arc::clone(task));
                    return Readiness::Parked(dependency);
                }
                None => {
                    return Readiness::Unsatisfiable {
                        dependency,
                        reason: "unknown task".to_string(),
                    };
                }
            }
        }
        Readiness::Ready
    }

    /// Take every task parked on `dependency`.
    pub(crate) fn release(&self, dependency: TaskId) -> Vec<Arc<Task>> {
        self.lock().remove(&dependency).unwrap_or_default()
    }

    /// Drop a parked task wherever it waits. Returns whether it was found.
    pub(crate) fn remove(&self, id: TaskId) -> bool {
        let mut parked = self.lock();
        let mut found = false;
        parked.retain(|_, waiting| {
            let before = waiting.len();
            waiting.retain(|task| task.id != id);
            found |= waiting.len() != before;
            !waiting.is_empty()
        });
        found
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, RetryPolicy, TaskRecord};
    use crate::request::TaskRequest;
    use chrono::Utc;
    use std::time::Duration;

    fn record(id: TaskId, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            id,
            label: None,
            priority: Priority::Normal,
            status,
            dependencies: Vec::new(),
            max_retries: 0,
            retry_count: 0,
            result: None,
            error: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn dependent_on(deps: &[TaskId]) -> Arc<Task> {
        let task = TaskRequest::lightweight(|_ctx| async { Ok(serde_json::Value::Null) })
            .depends_on_all(deps.iter().copied())
            .into_task(TaskId::new(), &RetryPolicy::none(), Duration::from_secs(1))
            .unwrap();
        Arc::new(task)
    }

    #[test]
    fn parks_on_first_unmet_dependency_and_releases() {
        let store = StatusStore::new();
        let (done, running) = (TaskId::new(), TaskId::new());
        store.set(record(done, TaskStatus::Completed));
        store.set(record(running, TaskStatus::Running));

        let waitlist = Waitlist::default();
        let task = dependent_on(&[done, running]);
        assert_eq!(
            waitlist.check_or_park(&task, &store),
            Readiness::Parked(running)
        );
        assert_eq!(waitlist.len(), 1);

        let released = waitlist.release(running);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, task.id);
        assert_eq!(waitlist.len(), 0);
    }

    #[test]
    fn failed_dependency_is_unsatisfiable() {
        let store = StatusStore::new();
        let failed = TaskId::new();
        store.set(record(failed, TaskStatus::Failed));

        let waitlist = Waitlist::default();
        let readiness = waitlist.check_or_park(&dependent_on(&[failed]), &store);
        assert_eq!(
            readiness,
            Readiness::Unsatisfiable {
                dependency: failed,
                reason: "failed".to_string()
            }
        );
        assert_eq!(waitlist.len(), 0);
    }

    #[test]
    fn remove_drops_parked_task() {
        let store = StatusStore::new();
        let pending = TaskId::new();
        store.set(record(pending, TaskStatus::Pending));

        let waitlist = Waitlist::default();
        let task = dependent_on(&[pending]);
        waitlist.check_or_park(&task, &store);

        assert!(waitlist.remove(task.id));
        assert!(!waitlist.remove(task.id));
        assert!(waitlist.release(pending).is_empty());
    }
}
