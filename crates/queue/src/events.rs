//! Job lifecycle events broadcast to subscribers.

use chrono::{DateTime, Utc};
use jobforge_core::{JobId, JobStatus};
use serde::{Deserialize, Serialize};

/// A lifecycle event, serialized as `{"event": "<kind>", ...}` so it can be
/// forwarded as-is over an SSE stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobEvent {
    Added {
        job_id: JobId,
        job_type: String,
        status: JobStatus,
    },
    Started {
        job_id: JobId,
        attempt: u32,
    },
    Progress {
        job_id: JobId,
        attempt: u32,
        progress: u8,
    },
    Completed {
        job_id: JobId,
        attempts: u32,
    },
    Retrying {
        job_id: JobId,
        attempt: u32,
        run_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        job_id: JobId,
        attempts: u32,
        error: String,
    },
    Cancelled {
        job_id: JobId,
    },
    Removed {
        job_id: JobId,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Added { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id }
            | JobEvent::Removed { job_id } => *job_id,
        }
    }

    /// Whether this event ends the job's life in the queue.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. }
                | JobEvent::Failed { .. }
                | JobEvent::Cancelled { .. }
                | JobEvent::Removed { .. }
        )
    }
}
