//! Periodic health sampling.
//!
//! The monitor reads the queue and the status store on a fixed interval and
//! derives backlog, moving-average execution time, and throughput over the
//! sampling window. Threshold crossings are logged as warnings. It never
//! writes to the queue or the store.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::MonitorSettings;
use crate::model::Priority;
use crate::queue::PriorityQueue;
use crate::store::{StatusStore, StoreSummary};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Samples averaged for the moving execution time.
    pub window: usize,
    pub queue_depth_warn: Option<usize>,
    pub running_warn: Option<usize>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&MonitorSettings::default())
    }
}

impl From<&MonitorSettings> for MonitorConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms),
            window: settings.window.max(1),
            queue_depth_warn: settings.queue_depth_warn,
            running_warn: settings.running_warn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorWarning {
    QueueDepth { depth: usize, threshold: usize },
    Running { running: usize, threshold: usize },
}

/// One observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSample {
    pub taken_at: DateTime<Utc>,
    /// Tasks in the queue, per priority.
    pub queue_depth: BTreeMap<Priority, usize>,
    /// Pending tasks, including those parked on a dependency.
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Mean execution time of tasks completed within the last `window`
    /// samples.
    pub avg_execution_ms: f64,
    /// Completed plus failed tasks per second since the previous sample.
    pub throughput_per_second: f64,
    pub warnings: Vec<MonitorWarning>,
}

impl MonitorSample {
    pub fn queue_total(&self) -> usize {
        self.queue_depth.values().sum()
    }
}

/// Where samples go: an external metrics system, a log, a test probe.
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, sample: &MonitorSample);
}

/// Logs each sample at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, sample: &MonitorSample) {
        debug!(
            queue = sample.queue_total(),
            pending = sample.pending,
            running = sample.running,
            completed = sample.completed,
            failed = sample.failed,
            cancelled = sample.cancelled,
            avg_execution_ms = sample.avg_execution_ms,
            throughput = sample.throughput_per_second,
            "monitor sample"
        );
    }
}

/// Writes samples to the OTel gauges in [`crate::telemetry::metrics`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OtelSink;

impl MetricsSink for OtelSink {
    fn record(&self, sample: &MonitorSample) {
        let depth = metrics::queue_depth();
        for (priority, n) in &sample.queue_depth {
            depth.record(*n as u64, &[KeyValue::new("priority", priority.to_string())]);
        }
        metrics::tasks_running().record(sample.running as u64, &[]);
        metrics::throughput().record(sample.throughput_per_second, &[]);
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    completed: usize,
    execution: Duration,
}

struct Baseline {
    at: DateTime<Utc>,
    finished: usize,
    completed: usize,
    execution: Duration,
}

impl Baseline {
    fn of(at: DateTime<Utc>, summary: &StoreSummary) -> Self {
        Self {
            at,
            finished: summary.finished(),
            completed: summary.completed,
            execution: summary.total_execution,
        }
    }
}

pub struct Monitor {
    queue: Arc<PriorityQueue>,
    store: Arc<StatusStore>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    sink: Arc<dyn MetricsSink>,
    windows: VecDeque<Window>,
    baseline: Baseline,
    queue_alarm: bool,
    running_alarm: bool,
}

impl Monitor {
    pub fn new(
        queue: Arc<PriorityQueue>,
        store: Arc<StatusStore>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let baseline = Baseline::of(clock.now(), &store.summary());
        Self {
            queue,
            store,
            clock,
            config,
            sink,
            windows: VecDeque::new(),
            baseline,
            queue_alarm: false,
            running_alarm: false,
        }
    }

    /// Take one sample and hand it to the sink.
    pub fn sample(&mut self) -> MonitorSample {
        let now = self.clock.now();
        let queue_depth = self.queue.depth_by_priority();
        let summary = self.store.summary();

        let elapsed = (now - self.baseline.at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        let finished = summary.finished().saturating_sub(self.baseline.finished);
        let throughput_per_second = if elapsed > 0.0 {
            finished as f64 / elapsed
        } else {
            0.0
        };

        self.windows.push_back(Window {
            completed: summary.completed.saturating_sub(self.baseline.completed),
            execution: summary
                .total_execution
                .saturating_sub(self.baseline.execution),
        });
        while self.windows.len() > self.config.window {
            self.windows.pop_front();
        }
        let (completed, execution) = self
            .windows
            .iter()
            .fold((0usize, Duration::ZERO), |(n, total), w| {
                (n + w.completed, total + w.execution)
            });
        let avg_execution_ms = if completed > 0 {
            execution.as_secs_f64() * 1000.0 / completed as f64
        } else {
            0.0
        };

        self.baseline = Baseline::of(now, &summary);

        let queue_total: usize = queue_depth.values().sum();
        let mut warnings = Vec::new();
        if let Some(threshold) = self.config.queue_depth_warn {
            let above = queue_total >= threshold;
            if above {
                warnings.push(MonitorWarning::QueueDepth {
                    depth: queue_total,
                    threshold,
                });
                if !self.queue_alarm {
                    warn!(depth = queue_total, threshold, "queue depth above threshold");
                }
            } else if self.queue_alarm {
                info!(depth = queue_total, threshold, "queue depth back below threshold");
            }
            self.queue_alarm = above;
        }
        if let Some(threshold) = self.config.running_warn {
            let above = summary.running >= threshold;
            if above {
                warnings.push(MonitorWarning::Running {
                    running: summary.running,
                    threshold,
                });
                if !self.running_alarm {
                    warn!(running = summary.running, threshold, "running tasks above threshold");
                }
            } else if self.running_alarm {
                info!(running = summary.running, threshold, "running tasks back below threshold");
            }
            self.running_alarm = above;
        }

        let sample = MonitorSample {
            taken_at: now,
            queue_depth,
            pending: summary.pending(),
            running: summary.running,
            retrying: summary.retrying,
            completed: summary.completed,
            failed: summary.failed,
            cancelled: summary.cancelled,
            avg_execution_ms,
            throughput_per_second,
            warnings,
        };
        self.sink.record(&sample);
        sample
    }

    /// Sample every `interval` until `shutdown` turns true or its sender
    /// goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sample();
                }
            }
        }
        debug!("monitor stopped");
    }
}
