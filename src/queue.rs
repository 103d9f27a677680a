//! Priority queue of pending tasks.
//!
//! Ordered by priority (highest first), then by enqueue sequence (oldest
//! first). `take` parks the caller on a [`Notify`] until something arrives.
//! The internal lock is never held across an `.await`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Priority, TaskId};
use crate::request::Task;

struct Entry {
    priority: Priority,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority wins, then the lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Concurrency-safe priority queue shared by the dispatcher and its workers.
pub struct PriorityQueue {
    inner: Mutex<Inner>,
    /// Wakes a worker parked in `take`.
    available: Notify,
    /// Wakes a submitter parked in `put_wait`.
    space: Notify,
    capacity: Option<usize>,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl PriorityQueue {
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: Notify::new(),
            space: Notify::new(),
            capacity: None,
        }
    }

    /// A queue that refuses new submissions once `capacity` tasks are waiting.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::unbounded()
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a task. Never blocks; fails with [`Error::QueueFull`] in bounded
    /// mode when at capacity.
    pub fn put(&self, task: Arc<Task>) -> Result<()> {
        self.put_then(task, || {})
    }

    /// Like [`PriorityQueue::put`], running `on_insert` under the queue lock
    /// once the task is in. No consumer can take the task before it returns.
    pub(crate) fn put_then<F: Fn()>(&self, task: Arc<Task>, on_insert: F) -> Result<()> {
        {
            let mut inner = self.lock();
            if let Some(cap) = self.capacity.filter(|cap| inner.heap.len() >= *cap) {
                return Err(Error::QueueFull(cap));
            }
            push(&mut inner, task);
            on_insert();
        }
        self.available.notify_one();
        Ok(())
    }

    /// Insert a task, waiting for room in bounded mode.
    pub async fn put_wait(&self, task: Arc<Task>) {
        self.put_wait_then(task, || {}).await;
    }

    pub(crate) async fn put_wait_then<F: Fn()>(&self, task: Arc<Task>, on_insert: F) {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.put_then(Arc::clone(&task), &on_insert) {
                Ok(()) => return,
                Err(_) => {
                    debug!(task_id = %task.id, "queue full, waiting for space");
                    space.await;
                }
            }
        }
    }

    /// Re-insert a task that was already admitted (retry or dependency
    /// wakeup). Ignores capacity so admitted work is never dropped.
    pub(crate) fn requeue(&self, task: Arc<Task>) {
        push(&mut self.lock(), task);
        self.available.notify_one();
    }

    /// Remove the highest-priority, earliest-enqueued task, waiting if empty.
    pub async fn take(&self) -> Arc<Task> {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(task) = self.try_take() {
                return task;
            }
            available.await;
        }
    }

    pub fn try_take(&self) -> Option<Arc<Task>> {
        let entry = self.lock().heap.pop()?;
        self.space.notify_one();
        Some(entry.task)
    }

    /// Drop a waiting task. Returns whether it was present.
    pub fn remove(&self, id: TaskId) -> bool {
        let removed = {
            let mut inner = self.lock();
            let before = inner.heap.len();
            inner.heap.retain(|entry| entry.task.id != id);
            inner.heap.len() != before
        };
        if removed {
            self.space.notify_one();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waiting tasks per priority; every priority is present.
    pub fn depth_by_priority(&self) -> BTreeMap<Priority, usize> {
        let mut depth: BTreeMap<Priority, usize> = Priority::ALL.iter().map(|p| (*p, 0)).collect();
        for entry in self.lock().heap.iter() {
            *depth.entry(entry.priority).or_default() += 1;
        }
        depth
    }
}

fn push(inner: &mut Inner, task: Arc<Task>) {
    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.heap.push(Entry {
        priority: task.priority,
        seq,
        task,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RetryPolicy;
    use crate::request::TaskRequest;
    use std::time::Duration;

    fn task(priority: Priority) -> Arc<Task> {
        let task = TaskRequest::lightweight(|_ctx| async { Ok(serde_json::Value::Null) })
            .priority(priority)
            .into_task(TaskId::new(), &RetryPolicy::none(), Duration::from_secs(1))
            .unwrap();
        Arc::new(task)
    }

    #[test]
    fn equal_priority_keeps_insertion_order() {
        let queue = PriorityQueue::unbounded();
        let a = task(Priority::Normal);
        let b = task(Priority::Normal);
        queue.put(Arc::clone(&a)).unwrap();
        queue.put(Arc::clone(&b)).unwrap();

        assert_eq!(queue.try_take().unwrap().id, a.id);
        assert_eq!(queue.try_take().unwrap().id, b.id);
    }

    #[test]
    fn requeue_ignores_capacity() {
        let queue = PriorityQueue::bounded(1);
        queue.put(task(Priority::Low)).unwrap();
        assert!(matches!(
            queue.put(task(Priority::Low)),
            Err(Error::QueueFull(1))
        ));

        queue.requeue(task(Priority::Low));
        assert_eq!(queue.len(), 2);
    }
}
