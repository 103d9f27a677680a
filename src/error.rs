//! Error types for taskq.
//!
//! [`Error`] is returned by the dispatcher's API. [`TaskError`] is the
//! failure attached to a task record; it is never returned to the submitter,
//! only observed through `get_status`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("invalid task request: {0}")]
    InvalidRequest(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(TaskId),

    #[error("queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("dispatcher is shut down")]
    ShutDown,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a task attempt (or the task as a whole) did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// The unit of work returned an error or panicked.
    #[error("execution failed: {message}")]
    Execution { message: String },

    /// The attempt did not finish before its deadline.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A dependency can no longer complete (it failed, was cancelled, or
    /// is unknown to the store).
    #[error("dependency {dependency} cannot complete: {reason}")]
    DependencyUnsatisfied { dependency: TaskId, reason: String },

    /// Cancelled by an explicit request while pending.
    #[error("cancellation requested")]
    CancellationRequested,
}

impl TaskError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
