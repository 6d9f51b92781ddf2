//! Queue error model.

use std::time::Duration;

use thiserror::Error;

use crate::id::JobId;
use crate::job::{FailureKind, JobStatus};

/// Result type used by every queue operation that can be rejected.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced synchronously to the caller of a queue operation.
///
/// Handler failures are *not* represented here: they are captured into the
/// job record as [`JobFailure`]s and only observed by reading the job back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Submission options were malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No handler is registered for the requested job type.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// The referenced job does not exist.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The job exists but its current status does not allow the operation.
    #[error("job {id} is {status}; cannot {action}")]
    InvalidState {
        id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    /// A record with this id is already stored.
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(id: JobId, status: JobStatus, action: &'static str) -> Self {
        Self::InvalidState { id, status, action }
    }
}

/// Why a single execution attempt failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobFailure {
    /// The handler returned an error (or panicked).
    #[error("execution failed: {0}")]
    Execution(String),

    /// The handler did not finish within the job's timeout.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl JobFailure {
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            JobFailure::Execution(_) => FailureKind::Execution,
            JobFailure::Timeout(_) => FailureKind::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_status_and_action() {
        let err = QueueError::invalid_state(JobId::from(7), JobStatus::Running, "remove");
        assert_eq!(err.to_string(), "job 7 is running; cannot remove");
    }

    #[test]
    fn timeout_failure_reports_milliseconds() {
        let failure = JobFailure::Timeout(Duration::from_millis(1500));
        assert_eq!(failure.to_string(), "timed out after 1500ms");
        assert_eq!(failure.kind(), FailureKind::Timeout);
    }
}
