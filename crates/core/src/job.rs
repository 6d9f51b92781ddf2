//! The job record and its lifecycle state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JobFailure, QueueError, QueueResult};
use crate::id::JobId;
use crate::options::JobOptions;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, eligible now
    Pending,
    /// Queued, eligible once `run_at` passes
    Delayed,
    /// Claimed by the dispatcher, handler in flight
    Running,
    /// Handler returned a result
    Completed,
    /// Attempts exhausted or a permanent failure
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Delayed,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Waiting in the ready queue (now or later).
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Delayed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Delayed => "delayed",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| QueueError::validation(format!("invalid job status: {s}")))
    }
}

/// Category of a recorded attempt failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Execution,
    Timeout,
}

/// One entry of the append-only error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorEntry {
    pub attempt: u32,
    pub kind: FailureKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// What happened to a job after a failed attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in the queue, eligible at `run_at`.
    Retry { run_at: DateTime<Utc>, delay: Duration },
    /// Moved to `failed`.
    Exhausted,
}

/// A unit of deferred work.
///
/// Records handed out by the store are snapshots; mutating a copy has no
/// effect until it is committed through a store transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    pub options: JobOptions,
    pub errors: Vec<JobErrorEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    /// Next instant the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Set on records created by `retry()`: the failed job this one replays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<JobId>,
}

impl Job {
    /// Create a new job. Options are expected to be validated already.
    pub fn new(
        id: JobId,
        job_type: impl Into<String>,
        payload: Value,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let run_at = add_duration(now, options.delay);
        let status = if options.delay.is_zero() {
            JobStatus::Pending
        } else {
            JobStatus::Delayed
        };

        Self {
            id,
            job_type: job_type.into(),
            payload,
            status,
            progress: 0,
            attempts: 0,
            options,
            errors: Vec::new(),
            result: None,
            created_at: now,
            run_at,
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            retry_of: None,
        }
    }

    /// Fresh record replaying `original` (same type, payload and options).
    pub fn retry_of(original: &Job, id: JobId, now: DateTime<Utc>) -> Self {
        let mut job = Self::new(
            id,
            original.job_type.clone(),
            original.payload.clone(),
            original.options.clone(),
            now,
        );
        job.retry_of = Some(original.id);
        job
    }

    /// Whether the dispatcher may claim the job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_waiting() && self.run_at <= now
    }

    pub fn last_error(&self) -> Option<&JobErrorEntry> {
        self.errors.last()
    }

    /// `pending|delayed → running`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        if !self.status.is_waiting() {
            return Err(self.invalid("claim"));
        }
        if self.attempts >= self.options.max_attempts {
            return Err(self.invalid("claim with no attempts left"));
        }

        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// `delayed → pending` once `run_at` has passed. No-op for other states.
    pub fn promote(&mut self) {
        if self.status == JobStatus::Delayed {
            self.status = JobStatus::Pending;
        }
    }

    /// `running → completed`.
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> QueueResult<()> {
        if self.status != JobStatus::Running {
            return Err(self.invalid("complete"));
        }

        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Record a failed attempt and decide between re-queue and `failed`.
    ///
    /// `retryable = false` fails the job regardless of remaining attempts.
    pub fn record_failure(
        &mut self,
        failure: &JobFailure,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<FailureOutcome> {
        if self.status != JobStatus::Running {
            return Err(self.invalid("record a failure"));
        }

        self.errors.push(JobErrorEntry {
            attempt: self.attempts,
            kind: failure.kind(),
            message: failure.to_string(),
            timestamp: now,
        });

        if retryable && self.attempts < self.options.max_attempts {
            let delay = self.options.backoff.next_delay(self.attempts);
            self.run_at = add_duration(now, delay);
            self.status = if delay.is_zero() {
                JobStatus::Pending
            } else {
                JobStatus::Delayed
            };
            Ok(FailureOutcome::Retry {
                run_at: self.run_at,
                delay,
            })
        } else {
            self.status = JobStatus::Failed;
            self.failed_at = Some(now);
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// Any non-terminal state → `cancelled`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }

        self.status = JobStatus::Cancelled;
        self.cancelled_at = Some(now);
        Ok(())
    }

    /// Store handler-reported progress for `attempt`.
    ///
    /// Returns `false` (and changes nothing) when the job is not running or a
    /// later attempt has already been claimed.
    pub fn set_progress(&mut self, attempt: u32, value: i64) -> bool {
        if self.status != JobStatus::Running || self.attempts != attempt {
            return false;
        }
        self.progress = clamp_progress(value);
        true
    }

    fn invalid(&self, action: &'static str) -> QueueError {
        QueueError::invalid_state(self.id, self.status, action)
    }
}

/// Clamp a reported progress value into `0..=100`.
pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

fn add_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use serde_json::json;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn test_job(options: JobOptions) -> Job {
        Job::new(
            JobId::from(1),
            "email",
            json!({"userId": "u1", "to": "a@b.com"}),
            options,
            test_time(),
        )
    }

    #[test]
    fn job_lifecycle() {
        let mut job = test_job(JobOptions::default());

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.progress, 0);

        job.claim(test_time()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        job.complete(json!({"sent": true}), test_time()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"sent": true})));
        assert!(job.completed_at.is_some());
        assert!(job.failed_at.is_none());
    }

    #[test]
    fn delayed_job_becomes_eligible_after_run_at() {
        let now = test_time();
        let job = Job::new(
            JobId::from(1),
            "export",
            Value::Null,
            JobOptions::default().with_delay(Duration::from_secs(5)),
            now,
        );

        assert_eq!(job.status, JobStatus::Delayed);
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn failure_with_attempts_left_schedules_retry() {
        let mut job = test_job(
            JobOptions::default()
                .with_max_attempts(2)
                .with_backoff(BackoffPolicy::fixed(Duration::from_millis(50))),
        );

        job.claim(test_time()).unwrap();
        let failed_at = test_time();
        let outcome = job
            .record_failure(&JobFailure::execution("smtp down"), true, failed_at)
            .unwrap();

        match outcome {
            FailureOutcome::Retry { run_at, delay } => {
                assert_eq!(delay, Duration::from_millis(50));
                assert_eq!(run_at, failed_at + chrono::Duration::milliseconds(50));
            }
            FailureOutcome::Exhausted => panic!("expected a retry"),
        }
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].attempt, 1);
        assert!(job.failed_at.is_none());

        job.claim(test_time()).unwrap();
        let outcome = job
            .record_failure(&JobFailure::execution("smtp down"), true, test_time())
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(job.failed_at.is_some());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn started_at_is_not_reset_on_reattempt() {
        let mut job = test_job(
            JobOptions::default()
                .with_max_attempts(2)
                .with_backoff(BackoffPolicy::none()),
        );

        job.claim(test_time()).unwrap();
        let first_start = job.started_at;
        job.record_failure(&JobFailure::execution("boom"), true, test_time())
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        job.claim(test_time()).unwrap();
        assert_eq!(job.started_at, first_start);
    }

    #[test]
    fn permanent_failure_skips_remaining_attempts() {
        let mut job = test_job(JobOptions::default().with_max_attempts(5));
        job.claim(test_time()).unwrap();

        let outcome = job
            .record_failure(&JobFailure::execution("bad payload"), false, test_time())
            .unwrap();

        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn timeout_is_recorded_with_its_kind() {
        let mut job = test_job(JobOptions::default());
        job.claim(test_time()).unwrap();
        job.record_failure(
            &JobFailure::Timeout(Duration::from_millis(100)),
            true,
            test_time(),
        )
        .unwrap();

        let entry = job.last_error().unwrap();
        assert_eq!(entry.kind, FailureKind::Timeout);
        assert_eq!(entry.message, "timed out after 100ms");
    }

    #[test]
    fn claim_never_exceeds_max_attempts() {
        let mut job = test_job(JobOptions::default());
        job.claim(test_time()).unwrap();
        job.status = JobStatus::Pending;

        assert!(matches!(
            job.claim(test_time()),
            Err(QueueError::InvalidState { .. })
        ));
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn terminal_jobs_reject_transitions() {
        let mut job = test_job(JobOptions::default());
        job.cancel(test_time()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancelled_at.is_some());

        assert!(job.claim(test_time()).is_err());
        assert!(job.cancel(test_time()).is_err());
        assert!(job.complete(Value::Null, test_time()).is_err());
    }

    #[test]
    fn progress_is_clamped_and_scoped_to_attempt() {
        let mut job = test_job(JobOptions::default().with_max_attempts(2));
        assert!(!job.set_progress(1, 50), "not running yet");

        job.claim(test_time()).unwrap();
        assert!(job.set_progress(1, 150));
        assert_eq!(job.progress, 100);
        assert!(job.set_progress(1, -3));
        assert_eq!(job.progress, 0);
        assert!(!job.set_progress(2, 40), "stale attempt");
    }

    #[test]
    fn retry_of_produces_fresh_record() {
        let mut original = test_job(JobOptions::default().with_priority(3));
        original.claim(test_time()).unwrap();
        original
            .record_failure(&JobFailure::execution("boom"), true, test_time())
            .unwrap();

        let copy = Job::retry_of(&original, JobId::from(2), test_time());
        assert_eq!(copy.id, JobId::from(2));
        assert_eq!(copy.retry_of, Some(original.id));
        assert_eq!(copy.attempts, 0);
        assert!(copy.errors.is_empty());
        assert_eq!(copy.options, original.options);
        assert_eq!(copy.payload, original.payload);
        assert_eq!(copy.status, JobStatus::Pending);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn serializes_camel_case_wire_shape() {
        let job = test_job(JobOptions::default().with_timeout(Duration::from_secs(2)));
        let json = serde_json::to_value(&job).unwrap();

        assert_eq!(json["type"], "email");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["options"]["timeoutMs"], 2000);
        assert_eq!(json["options"]["maxAttempts"], 1);
        assert!(json.get("createdAt").is_some());
        assert!(json.get("result").is_none());
    }
}
