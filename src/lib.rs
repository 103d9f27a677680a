//! # taskq
//!
//! In-process background task dispatcher.
//!
//! Tasks are ordered by priority then submission, run by a fixed pool of
//! workers under a per-attempt deadline, retried with backoff, and held back
//! until their dependencies complete. Blocking work runs on a separate
//! bounded executor so it cannot stall the workers.
//!
//! ```no_run
//! use std::time::Duration;
//! use taskq::{Dispatcher, DispatcherConfig, Priority, TaskRequest};
//!
//! # async fn demo() -> taskq::error::Result<()> {
//! let dispatcher = Dispatcher::start(DispatcherConfig::default())?;
//! let id = dispatcher.submit(
//!     TaskRequest::lightweight(|_ctx| async { Ok(serde_json::json!({"ok": true})) })
//!         .priority(Priority::High)
//!         .max_retries(2)
//!         .timeout(Duration::from_secs(5)),
//! )?;
//! let record = dispatcher.get_status(id)?;
//! println!("{}", record.status);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod monitor;
pub mod queue;
pub mod request;
pub mod store;
pub mod telemetry;
pub mod work;

pub use batch::BatchProcessor;
pub use engine::{Dispatcher, DispatcherConfig};
pub use error::{Error, Result, TaskError};
pub use model::{DispatcherStats, Priority, RetryPolicy, TaskId, TaskRecord, TaskStatus};
pub use request::TaskRequest;
pub use work::{TaskContext, Work, WorkResult};
