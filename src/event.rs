//! Structured events emitted by the dispatcher on every state transition.
//!
//! Consumers subscribe to the event stream to build dashboards, alerting,
//! or audit logs. Slow subscribers lag and lose the oldest events; the
//! dispatcher never waits on them.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::TaskError;
use crate::model::{Priority, TaskId, TaskStatus};
use crate::work::ExecutionMode;

/// A structured event emitted by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskSubmitted {
        id: TaskId,
        label: Option<String>,
        priority: Priority,
        mode: ExecutionMode,
    },
    TaskParked {
        id: TaskId,
        waiting_on: TaskId,
    },
    TaskDispatched {
        id: TaskId,
        worker: usize,
        attempt: u32,
    },
    TaskCompleted {
        id: TaskId,
        duration_ms: u64,
    },
    TaskRetrying {
        id: TaskId,
        attempt: u32,
        delay_ms: u64,
        error: TaskError,
    },
    TaskFailed {
        id: TaskId,
        attempts: u32,
        error: TaskError,
    },
    TaskCancelled {
        id: TaskId,
        reason: TaskError,
    },
    /// A timed-out blocking execution was left running.
    ExecutionAbandoned {
        id: TaskId,
        attempt: u32,
    },
}

impl EventKind {
    pub fn task_id(&self) -> TaskId {
        match self {
            EventKind::TaskSubmitted { id, .. }
            | EventKind::TaskParked { id, .. }
            | EventKind::TaskDispatched { id, .. }
            | EventKind::TaskCompleted { id, .. }
            | EventKind::TaskRetrying { id, .. }
            | EventKind::TaskFailed { id, .. }
            | EventKind::TaskCancelled { id, .. }
            | EventKind::ExecutionAbandoned { id, .. } => *id,
        }
    }

    /// Status the task is in once this event has happened, if it changed.
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            EventKind::TaskSubmitted { .. } => Some(TaskStatus::Pending),
            EventKind::TaskDispatched { .. } => Some(TaskStatus::Running),
            EventKind::TaskCompleted { .. } => Some(TaskStatus::Completed),
            EventKind::TaskRetrying { .. } => Some(TaskStatus::Retrying),
            EventKind::TaskFailed { .. } => Some(TaskStatus::Failed),
            EventKind::TaskCancelled { .. } => Some(TaskStatus::Cancelled),
            EventKind::TaskParked { .. } | EventKind::ExecutionAbandoned { .. } => None,
        }
    }
}

/// Sequenced fan-out of events.
pub(crate) struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, timestamp: DateTime<Utc>, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp,
            kind,
        };
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
