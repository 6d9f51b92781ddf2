//! `jobforge-core`: job queue domain building blocks.
//!
//! This crate contains the **pure** parts of the queue: identifiers, the job
//! record and its state machine, submission options and the backoff policy.
//! Nothing here touches an async runtime; scheduling lives in `jobforge-queue`.

pub mod backoff;
pub mod error;
pub mod id;
pub mod job;
pub mod options;
pub mod serde_ms;

pub use backoff::{BackoffPolicy, BackoffStrategy, DEFAULT_BACKOFF_BASE};
pub use error::{JobFailure, QueueError, QueueResult};
pub use id::{JobId, JobIdSequence};
pub use job::{FailureKind, FailureOutcome, Job, JobErrorEntry, JobStatus, clamp_progress};
pub use options::JobOptions;
