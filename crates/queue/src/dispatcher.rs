//! Scheduling loop: promotes due jobs, claims eligible ones while worker
//! slots are free and hands them to the executor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobforge_core::{Job, JobId, JobStatus, QueueError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::events::JobEvent;
use crate::executor;
use crate::queue::Shared;
use crate::store::JobStore;

const CLAIMABLE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Delayed];

pub(crate) async fn run<S: JobStore>(shared: Arc<Shared<S>>) {
    info!(
        queue = %shared.config.name,
        concurrency = shared.config.concurrency,
        "job dispatcher started"
    );

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        dispatch_ready(&shared);

        let next_wakeup = shared.lock_ready().next_wakeup();
        let sleep_for = next_wakeup.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

        tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
            _ = sleep_or_park(sleep_for) => {}
        }
    }

    info!(queue = %shared.config.name, "job dispatcher stopped");
}

async fn sleep_or_park(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Claim and start as many eligible jobs as there are free worker slots.
fn dispatch_ready<S: JobStore>(shared: &Arc<Shared<S>>) {
    let promoted = shared.lock_ready().promote_due(Utc::now());
    for id in promoted {
        let res = shared
            .store
            .compare_and_update(id, &[JobStatus::Delayed], |job| {
                job.promote();
                Ok(())
            });
        if let Err(QueueError::NotFound(_)) = res {
            debug!(job_id = %id, "due job was removed before promotion");
        }
    }

    loop {
        let Ok(permit) = Arc::clone(&shared.permits).try_acquire_owned() else {
            break;
        };
        let Some(entry) = shared.lock_ready().pop() else {
            break;
        };

        if let Some((job, token)) = claim(shared, entry.id) {
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                "claimed job"
            );
            shared.emit(JobEvent::Started {
                job_id: job.id,
                attempt: job.attempts,
            });
            executor::spawn(Arc::clone(shared), job, token, permit);
        }
    }
}

/// Move a waiting job to `running`. `None` when the entry is stale.
fn claim<S: JobStore>(shared: &Shared<S>, id: JobId) -> Option<(Job, CancellationToken)> {
    // Registered before the transition so that a concurrent cancel() always
    // finds the token of a running job.
    let token = CancellationToken::new();
    shared.lock_running().insert(id, token.clone());

    let claimed = shared.store.compare_and_update(id, &CLAIMABLE, |job| {
        job.claim(Utc::now())?;
        Ok(job.clone())
    });

    match claimed {
        Ok(Some(job)) => Some((job, token)),
        Ok(None) | Err(QueueError::NotFound(_)) => {
            shared.lock_running().remove(&id);
            None
        }
        Err(e) => {
            shared.lock_running().remove(&id);
            error!(job_id = %id, error = %e, "failed to claim job");
            None
        }
    }
}
