//! In-memory status store.
//!
//! Authoritative map from task id to [`TaskRecord`] for the lifetime of the
//! dispatcher. Point lookups and single-record updates only. Every write is
//! mirrored to a [`StateBackend`] after the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{Priority, TaskId, TaskRecord, TaskStatus};

/// Durable mirror of task state. Writes are best effort: a failing backend
/// is logged and never stalls the dispatcher.
pub trait StateBackend: Send + Sync + 'static {
    fn save(&self, record: &TaskRecord) -> Result<()>;
}

/// Backend that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl StateBackend for NullBackend {
    fn save(&self, _record: &TaskRecord) -> Result<()> {
        Ok(())
    }
}

/// Counts across all records, taken under a single read lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSummary {
    pub pending_by_priority: BTreeMap<Priority, usize>,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Sum of final-attempt execution time over completed tasks.
    pub total_execution: Duration,
}

impl StoreSummary {
    pub fn pending(&self) -> usize {
        self.pending_by_priority.values().sum()
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    pub fn avg_execution(&self) -> Option<Duration> {
        let n = u32::try_from(self.completed).ok().filter(|n| *n > 0)?;
        Some(self.total_execution / n)
    }
}

pub struct StatusStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    backend: Arc<dyn StateBackend>,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusStore {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(NullBackend))
    }

    pub fn with_backend(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            backend,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, record: &TaskRecord) {
        if let Err(e) = self.backend.save(record) {
            warn!(task_id = %record.id, error = %e, "state backend write failed");
        }
    }

    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.read().get(&id).cloned()
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.read().get(&id).map(|r| r.status)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a record wholesale.
    pub fn set(&self, record: TaskRecord) {
        self.write().insert(record.id, record.clone());
        self.persist(&record);
    }

    /// Forget a record. Only used to roll back a rejected submission.
    pub(crate) fn remove(&self, id: TaskId) -> Option<TaskRecord> {
        self.write().remove(&id)
    }

    /// Apply a partial update. Terminal records are frozen, and a status
    /// change made by `f` must be a legal transition; otherwise nothing is
    /// written.
    pub fn update<F>(&self, id: TaskId, f: F) -> Result<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let updated = {
            let mut records = self.write();
            let current = records.get_mut(&id).ok_or(Error::NotFound(id))?;
            let mut next = current.clone();
            f(&mut next);
            next.id = current.id;
            let legal = if next.status == current.status {
                !current.status.is_terminal()
            } else {
                current.status.can_transition_to(next.status)
            };
            if !legal {
                return Err(Error::InvalidTransition {
                    from: current.status,
                    to: next.status,
                });
            }
            *current = next.clone();
            next
        };
        self.persist(&updated);
        Ok(updated)
    }

    /// Move a task to `to`, applying `f` in the same write. Fails without
    /// writing if the task is not in a state that may move to `to`, which
    /// makes this a compare-and-set against concurrent cancellation.
    pub fn transition<F>(&self, id: TaskId, to: TaskStatus, f: F) -> Result<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord),
    {
        self.update(id, |record| {
            f(record);
            record.status = to;
        })
    }

    pub fn summary(&self) -> StoreSummary {
        let mut summary = StoreSummary {
            pending_by_priority: Priority::ALL.iter().map(|p| (*p, 0)).collect(),
            ..StoreSummary::default()
        };
        for record in self.read().values() {
            match record.status {
                TaskStatus::Pending => {
                    *summary.pending_by_priority.entry(record.priority).or_default() += 1;
                }
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Retrying => summary.retrying += 1,
                TaskStatus::Completed => {
                    summary.completed += 1;
                    summary.total_execution += record.execution_time().unwrap_or_default();
                }
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }
}
