//! Batch submission on top of the dispatcher's public contract.
//!
//! Items are split into chunks, one task per chunk. At most
//! `max_concurrent_batches` chunk tasks are unfinished at any time; beyond
//! that, submission waits by polling the status of earlier chunks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Dispatcher;
use crate::error::{Error, Result};
use crate::model::{Priority, TaskId};
use crate::request::TaskRequest;
use crate::work::WorkResult;

pub struct BatchProcessor {
    dispatcher: Dispatcher,
    priority: Priority,
    poll_interval: Duration,
    label: Option<String>,
}

impl BatchProcessor {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            priority: Priority::Normal,
            poll_interval: Duration::from_millis(100),
            label: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Prefix for chunk labels ("{label}[{n}]").
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Submit `items` in chunks of `batch_size`, each processed by `handler`.
    ///
    /// Returns chunk task ids in item order. Returns once every chunk is
    /// submitted, not when they finish.
    pub async fn submit_batch<T, F, Fut>(
        &self,
        items: Vec<T>,
        batch_size: usize,
        max_concurrent_batches: usize,
        handler: F,
    ) -> Result<Vec<TaskId>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkResult> + Send + 'static,
    {
        if batch_size == 0 || max_concurrent_batches == 0 {
            return Err(Error::InvalidRequest(
                "batch_size and max_concurrent_batches must be at least 1".into(),
            ));
        }

        let handler = Arc::new(handler);
        let mut ids = Vec::with_capacity(items.len().div_ceil(batch_size));
        let mut in_flight: Vec<TaskId> = Vec::new();

        for (n, chunk) in items.chunks(batch_size).enumerate() {
            while in_flight.len() >= max_concurrent_batches {
                in_flight.retain(|id| !self.is_finished(*id));
                if in_flight.len() >= max_concurrent_batches {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }

            let chunk: Arc<[T]> = Arc::from(chunk);
            let handler = Arc::clone(&handler);
            let mut request = TaskRequest::lightweight(move |_ctx| (*handler)(chunk.to_vec()))
                .priority(self.priority);
            if let Some(label) = &self.label {
                request = request.label(format!("{label}[{n}]"));
            }

            let id = self.dispatcher.submit_wait(request).await?;
            debug!(task_id = %id, chunk = n, "batch chunk submitted");
            in_flight.push(id);
            ids.push(id);
        }

        info!(chunks = ids.len(), batch_size, "batch submitted");
        Ok(ids)
    }

    fn is_finished(&self, id: TaskId) -> bool {
        self.dispatcher
            .get_status(id)
            .map(|record| record.status.is_terminal())
            .unwrap_or(true)
    }
}
