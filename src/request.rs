//! Task submission: the request builder and the immutable task it becomes.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{Priority, RetryPolicy, TaskId};
use crate::work::{TaskContext, Work, WorkResult};

/// Builder for submitting work. Unset policy fields fall back to the
/// dispatcher's defaults.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub(crate) work: Work,
    pub(crate) label: Option<String>,
    pub(crate) priority: Priority,
    pub(crate) max_retries: Option<u32>,
    pub(crate) retry_delay: Option<Duration>,
    pub(crate) backoff_multiplier: Option<f64>,
    pub(crate) max_retry_delay: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) dependencies: Vec<TaskId>,
}

impl TaskRequest {
    pub fn new(work: Work) -> Self {
        Self {
            work,
            label: None,
            priority: Priority::Normal,
            max_retries: None,
            retry_delay: None,
            backoff_multiplier: None,
            max_retry_delay: None,
            timeout: None,
            dependencies: Vec::new(),
        }
    }

    /// Cooperative async work.
    pub fn lightweight<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkResult> + Send + 'static,
    {
        Self::new(Work::lightweight(f))
    }

    /// Blocking or CPU-heavy work for the blocking executor.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(TaskContext) -> WorkResult + Send + Sync + 'static,
    {
        Self::new(Work::blocking(f))
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    pub fn max_retry_delay(mut self, cap: Duration) -> Self {
        self.max_retry_delay = Some(cap);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn depends_on_all(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        for id in ids {
            self = self.depends_on(id);
        }
        self
    }

    /// Resolve defaults and validate, producing the task to enqueue.
    pub(crate) fn into_task(
        self,
        id: TaskId,
        default_retry: &RetryPolicy,
        default_timeout: Duration,
    ) -> Result<Task> {
        let retry = RetryPolicy {
            max_retries: self.max_retries.unwrap_or(default_retry.max_retries),
            retry_delay: self.retry_delay.unwrap_or(default_retry.retry_delay),
            multiplier: self.backoff_multiplier.unwrap_or(default_retry.multiplier),
            max_delay: self.max_retry_delay.or(default_retry.max_delay),
        };
        retry.validate()?;

        let timeout = self.timeout.unwrap_or(default_timeout);
        if timeout.is_zero() {
            return Err(Error::InvalidRequest("timeout must be non-zero".to_string()));
        }

        Ok(Task {
            id,
            label: self.label,
            priority: self.priority,
            work: self.work,
            retry,
            timeout,
            dependencies: self.dependencies,
        })
    }
}

/// A submitted task: identity, work, and policy. Never changes after
/// submission; execution state lives in the status store.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub label: Option<String>,
    pub priority: Priority,
    pub work: Work,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub dependencies: Vec<TaskId>,
}

impl Task {
    /// Label if set, otherwise the short id.
    pub fn name(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => self.id.to_string(),
        }
    }
}
