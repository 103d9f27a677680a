//! Units of work and how they are executed.
//!
//! Arguments are captured by the closure at submission time; the dispatcher
//! only ever calls `execute(ctx)`. The submitter declares whether the work is
//! cooperative ([`Work::Lightweight`]) or blocking ([`Work::Blocking`]).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Priority, TaskId};

/// What a unit of work returns. The error is opaque to the dispatcher and is
/// recorded by its display form.
pub type WorkResult = anyhow::Result<serde_json::Value>;

/// Per-attempt information handed to the work.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub priority: Priority,
    /// Deadline for this attempt.
    pub timeout: Duration,
}

/// Cooperative work, awaited on the scheduler runtime.
#[async_trait]
pub trait AsyncWork: Send + Sync + 'static {
    async fn execute(&self, ctx: TaskContext) -> WorkResult;
}

#[async_trait]
impl<F, Fut> AsyncWork for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> WorkResult {
        (self)(ctx).await
    }
}

/// Blocking or CPU-heavy work, run on the bounded blocking executor.
pub trait BlockingWork: Send + Sync + 'static {
    fn execute(&self, ctx: TaskContext) -> WorkResult;
}

impl<F> BlockingWork for F
where
    F: Fn(TaskContext) -> WorkResult + Send + Sync + 'static,
{
    fn execute(&self, ctx: TaskContext) -> WorkResult {
        (self)(ctx)
    }
}

/// A unit of work, tagged with how it must be executed.
///
/// Work may run more than once when retried, so it is called through `&self`.
#[derive(Clone)]
pub enum Work {
    /// Runs as a task on the async runtime. On deadline it is aborted at its
    /// next `.await`.
    Lightweight(Arc<dyn AsyncWork>),
    /// Runs on a thread from the blocking executor. The deadline starts once
    /// a thread is free; time spent waiting for one does not count against
    /// `timeout`. A blocking call cannot be pre-empted: on deadline the attempt is recorded as timed out, its
    /// executor slot is handed to a replacement, and the thread is abandoned.
    /// It keeps running until the closure returns and its result is
    /// discarded. This is not strict isolation; work with side effects
    /// should observe `ctx.timeout` itself.
    Blocking(Arc<dyn BlockingWork>),
}

impl Work {
    pub fn lightweight(work: impl AsyncWork) -> Self {
        Self::Lightweight(Arc::new(work))
    }

    pub fn blocking(work: impl BlockingWork) -> Self {
        Self::Blocking(Arc::new(work))
    }

    pub fn mode(&self) -> ExecutionMode {
        match self {
            Work::Lightweight(_) => ExecutionMode::Lightweight,
            Work::Blocking(_) => ExecutionMode::Blocking,
        }
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Work::{:?}", self.mode())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Lightweight,
    Blocking,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Lightweight => write!(f, "lightweight"),
            ExecutionMode::Blocking => write!(f, "blocking"),
        }
    }
}
