//! `jobforge-queue`: the asynchronous job queue runtime.
//!
//! A [`JobQueue`] accepts jobs, orders them by priority and creation time,
//! runs their handlers on tokio tasks under a concurrency bound and a
//! per-attempt timeout, and retries failures according to each job's
//! backoff policy.
//!
//! ```no_run
//! use jobforge_queue::{HandlerRegistry, JobOptions, JobQueue, QueueConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), jobforge_queue::QueueError> {
//! let registry = HandlerRegistry::new().with("email.send", |payload, _ctx| async move {
//!     Ok(json!({ "sent": payload["to"] }))
//! });
//!
//! let queue = JobQueue::new(registry, QueueConfig::from_env())?;
//! queue.start();
//!
//! let job = queue.add("email.send", json!({"to": "a@b.com"}), JobOptions::default())?;
//! let snapshot = queue.get_job(job.id)?;
//! # let _ = snapshot;
//! queue.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod dispatcher;
pub mod events;
mod executor;
pub mod handler;
pub mod queue;
pub mod ready;
pub mod registry;
pub mod store;

pub use config::QueueConfig;
pub use events::JobEvent;
pub use executor::ExecutorStats;
pub use handler::{HandlerError, JobContext, JobHandler, ProgressReporter};
pub use queue::{JobQueue, QueueStats};
pub use ready::{ReadyEntry, ReadyQueue};
pub use registry::{HandlerFn, HandlerRegistry};
pub use store::{InMemoryJobStore, JobFilter, JobStats, JobStore};

pub use jobforge_core::{
    BackoffPolicy, BackoffStrategy, FailureKind, Job, JobErrorEntry, JobFailure, JobId,
    JobOptions, JobStatus, QueueError, QueueResult,
};
