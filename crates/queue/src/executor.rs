//! Runs a claimed job's handler under timeout supervision and writes the
//! outcome back to the store.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use jobforge_core::{FailureOutcome, Job, JobFailure, JobId, JobStatus, QueueError};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::events::JobEvent;
use crate::handler::{JobContext, ProgressReporter};
use crate::queue::Shared;
use crate::ready::ReadyEntry;
use crate::registry::HandlerFn;
use crate::store::JobStore;

/// Executor runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorStats {
    /// Attempts whose outcome was written back
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Jobs that ended in `failed`
    pub jobs_failed: u64,
    /// Failed attempts that were re-queued
    pub jobs_retried: u64,
    pub jobs_timed_out: u64,
    pub handler_panics: u64,
    /// Attempts whose outcome was dropped (cancelled or removed meanwhile)
    pub outcomes_discarded: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ExecutorCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    panics: AtomicU64,
    discarded: AtomicU64,
}

impl ExecutorCounters {
    pub(crate) fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_timed_out: self.timed_out.load(Ordering::Relaxed),
            handler_panics: self.panics.load(Ordering::Relaxed),
            outcomes_discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// How an attempt ended, from the supervisor's point of view.
#[derive(Debug)]
enum Outcome {
    Succeeded(Value),
    Failed { failure: JobFailure, retryable: bool },
    Panicked(String),
    /// The job was cancelled while the handler ran.
    Abandoned,
}

/// Execute a claimed job on the queue's task tracker. The worker slot held by
/// `permit` is released when the outcome has been recorded.
pub(crate) fn spawn<S: JobStore>(
    shared: Arc<Shared<S>>,
    job: Job,
    token: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    let tracker = shared.tracker.clone();
    tracker.spawn(async move {
        let id = job.id;
        let attempt = job.attempts;
        let mut slot = AttemptSlot {
            shared: Arc::clone(&shared),
            id,
            attempt,
            permit: Some(permit),
            settled: false,
        };

        let outcome = match shared.registry.resolve(&job.job_type) {
            Some(handler) => {
                let timeout = job.options.timeout.unwrap_or(shared.config.default_timeout);
                let progress = progress_reporter(&shared, id, attempt);
                let ctx = JobContext::new(id, attempt, progress, token.clone());
                supervise(handler, job.payload, ctx, timeout, &token).await
            }
            None => Outcome::Failed {
                failure: JobFailure::execution(format!(
                    "no handler registered for job type {}",
                    job.job_type
                )),
                retryable: false,
            },
        };

        // The token must leave the running set before the record can go back
        // to the ready queue, or a re-claim could find a stale token.
        slot.settle();
        record(&shared, id, attempt, outcome);
    });
}

/// Worker slot of one attempt. Dropping it frees the slot and wakes the
/// dispatcher; if the attempt never settled (the executor task unwound), the
/// job's token is released and the attempt is recorded as failed.
struct AttemptSlot<S: JobStore> {
    shared: Arc<Shared<S>>,
    id: JobId,
    attempt: u32,
    permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl<S: JobStore> AttemptSlot<S> {
    fn settle(&mut self) {
        self.shared.lock_running().remove(&self.id);
        self.settled = true;
    }
}

impl<S: JobStore> Drop for AttemptSlot<S> {
    fn drop(&mut self) {
        if !self.settled {
            self.settle();
            error!(job_id = %self.id, attempt = self.attempt, "job supervision aborted");
            record_failure(
                &self.shared,
                self.id,
                self.attempt,
                JobFailure::execution("job supervision aborted"),
                true,
            );
        }
        drop(self.permit.take());
        self.shared.wake.notify_one();
    }
}

async fn supervise(
    handler: HandlerFn,
    payload: Value,
    ctx: JobContext,
    timeout: Duration,
    token: &CancellationToken,
) -> Outcome {
    // Spawned separately so that a timed-out handler can be left running
    // detached instead of being dropped mid-await. The handler is invoked
    // inside the task so a panic while building its future is caught too.
    let mut task = tokio::spawn(async move { handler(payload, ctx).await });

    tokio::select! {
        biased;

        _ = token.cancelled() => Outcome::Abandoned,

        res = tokio::time::timeout(timeout, &mut task) => match res {
            Ok(Ok(Ok(value))) => Outcome::Succeeded(value),
            Ok(Ok(Err(e))) => Outcome::Failed {
                failure: JobFailure::execution(e.message()),
                retryable: e.is_retryable(),
            },
            Ok(Err(join_err)) => Outcome::Panicked(join_error_message(join_err)),
            Err(_) => {
                token.cancel();
                Outcome::Failed {
                    failure: JobFailure::Timeout(timeout),
                    retryable: true,
                }
            }
        },
    }
}

fn record<S: JobStore>(shared: &Shared<S>, id: JobId, attempt: u32, outcome: Outcome) {
    let counters = &shared.counters;

    match outcome {
        Outcome::Abandoned => {
            ExecutorCounters::bump(&counters.discarded);
            debug!(job_id = %id, attempt, "handler abandoned after cancellation");
        }
        Outcome::Succeeded(value) => {
            let res = shared
                .store
                .compare_and_update(id, &[JobStatus::Running], |job| {
                    job.complete(value, Utc::now())
                });
            match res {
                Ok(Some(())) => {
                    ExecutorCounters::bump(&counters.processed);
                    ExecutorCounters::bump(&counters.succeeded);
                    debug!(job_id = %id, attempt, "job completed");
                    shared.emit(JobEvent::Completed {
                        job_id: id,
                        attempts: attempt,
                    });
                }
                other => discard(shared, id, attempt, other.err()),
            }
        }
        Outcome::Panicked(message) => {
            ExecutorCounters::bump(&counters.panics);
            record_failure(shared, id, attempt, JobFailure::execution(message), true);
        }
        Outcome::Failed { failure, retryable } => {
            if matches!(failure, JobFailure::Timeout(_)) {
                ExecutorCounters::bump(&counters.timed_out);
            }
            record_failure(shared, id, attempt, failure, retryable);
        }
    }
}

fn record_failure<S: JobStore>(
    shared: &Shared<S>,
    id: JobId,
    attempt: u32,
    failure: JobFailure,
    retryable: bool,
) {
    let counters = &shared.counters;
    let res = shared.store.compare_and_update(id, &[JobStatus::Running], |job| {
        let outcome = job.record_failure(&failure, retryable, Utc::now())?;
        Ok((outcome, ReadyEntry::of(job)))
    });

    match res {
        Ok(Some((FailureOutcome::Retry { run_at, delay }, entry))) => {
            ExecutorCounters::bump(&counters.processed);
            ExecutorCounters::bump(&counters.retried);
            warn!(
                job_id = %id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "job attempt failed; retry scheduled"
            );
            shared.enqueue(entry, run_at);
            shared.emit(JobEvent::Retrying {
                job_id: id,
                attempt,
                run_at,
                error: failure.to_string(),
            });
        }
        Ok(Some((FailureOutcome::Exhausted, _))) => {
            ExecutorCounters::bump(&counters.processed);
            ExecutorCounters::bump(&counters.failed);
            error!(
                job_id = %id,
                attempts = attempt,
                retryable,
                error = %failure,
                "job failed"
            );
            shared.emit(JobEvent::Failed {
                job_id: id,
                attempts: attempt,
                error: failure.to_string(),
            });
        }
        other => discard(shared, id, attempt, other.err()),
    }
}

fn discard<S: JobStore>(shared: &Shared<S>, id: JobId, attempt: u32, err: Option<QueueError>) {
    ExecutorCounters::bump(&shared.counters.discarded);
    match err {
        None | Some(QueueError::NotFound(_)) => {
            debug!(job_id = %id, attempt, "job left running state; outcome discarded")
        }
        Some(e) => error!(job_id = %id, attempt, error = %e, "failed to record job outcome"),
    }
}

fn progress_reporter<S: JobStore>(shared: &Arc<Shared<S>>, id: JobId, attempt: u32) -> ProgressReporter {
    let shared = Arc::clone(shared);
    ProgressReporter::new(move |value| {
        let res = shared.store.compare_and_update(id, &[JobStatus::Running], |job| {
            Ok(job.set_progress(attempt, value).then_some(job.progress))
        });
        if let Ok(Some(Some(progress))) = res {
            shared.emit(JobEvent::Progress {
                job_id: id,
                attempt,
                progress,
            });
        }
    })
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "handler task was cancelled".to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("handler panicked: {detail}")
}
