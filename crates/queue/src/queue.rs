//! The `JobQueue` facade.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use jobforge_core::{Job, JobId, JobOptions, JobStatus, QueueError, QueueResult};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::dispatcher;
use crate::events::JobEvent;
use crate::executor::{ExecutorCounters, ExecutorStats};
use crate::ready::{ReadyEntry, ReadyQueue};
use crate::registry::HandlerRegistry;
use crate::store::{InMemoryJobStore, JobFilter, JobStats, JobStore};

/// State shared by the facade, the dispatcher and executor tasks.
pub(crate) struct Shared<S> {
    pub(crate) store: S,
    pub(crate) registry: HandlerRegistry,
    pub(crate) config: QueueConfig,
    pub(crate) ready: Mutex<ReadyQueue>,
    /// Cancellation tokens of claimed jobs.
    pub(crate) running: Mutex<HashMap<JobId, CancellationToken>>,
    pub(crate) wake: Notify,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) events: broadcast::Sender<JobEvent>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) counters: ExecutorCounters,
}

impl<S: JobStore> Shared<S> {
    pub(crate) fn lock_ready(&self) -> MutexGuard<'_, ReadyQueue> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_running(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a waiting job in the ready queue and wake the dispatcher.
    pub(crate) fn enqueue(&self, entry: ReadyEntry, run_at: chrono::DateTime<Utc>) {
        self.lock_ready().push(entry, run_at, Utc::now());
        self.wake.notify_one();
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Take a job that will never run out of the ready queue.
    fn unqueue(&self, id: JobId) {
        self.lock_ready().remove(id);
    }

    /// Cancel a job's token if it is currently executing.
    fn signal_cancel(&self, id: JobId) {
        if let Some(token) = self.lock_running().remove(&id) {
            token.cancel();
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Record counts per status.
    pub jobs: JobStats,
    /// Handlers currently holding a worker slot.
    pub running: usize,
    /// Jobs waiting in the ready queue, delayed ones included.
    pub queued: usize,
    pub executor: ExecutorStats,
}

/// Asynchronous job queue.
///
/// Jobs can be added before [`start`](Self::start); they are dispatched once
/// the dispatcher runs. Dropping the queue stops the dispatcher but does not
/// wait for running handlers; use [`shutdown`](Self::shutdown) for that.
pub struct JobQueue<S: JobStore = InMemoryJobStore> {
    shared: Arc<Shared<S>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue<InMemoryJobStore> {
    /// Queue backed by an [`InMemoryJobStore`].
    pub fn new(registry: HandlerRegistry, config: QueueConfig) -> QueueResult<Self> {
        Self::with_store(InMemoryJobStore::new(), registry, config)
    }
}

impl<S: JobStore> JobQueue<S> {
    pub fn with_store(store: S, registry: HandlerRegistry, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        let shared = Shared {
            store,
            registry,
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
            ready: Mutex::new(ReadyQueue::new()),
            running: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            counters: ExecutorCounters::default(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    /// Spawn the dispatcher on the current tokio runtime.
    ///
    /// Calling it again while the dispatcher runs, or after shutdown, does
    /// nothing.
    pub fn start(&self) {
        let mut slot = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        if self.shared.shutdown.is_cancelled() {
            warn!(queue = %self.shared.config.name, "start() called after shutdown");
            return;
        }
        *slot = Some(tokio::spawn(dispatcher::run(Arc::clone(&self.shared))));
    }

    /// Submit a job.
    ///
    /// Fails with `Validation` on malformed options or an empty type and with
    /// `UnknownJobType` when no handler matches. Nothing is stored on error.
    pub fn add(
        &self,
        job_type: impl Into<String>,
        payload: Value,
        mut options: JobOptions,
    ) -> QueueResult<Job> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(QueueError::validation("job type must not be empty"));
        }
        if !self.shared.registry.contains(&job_type) {
            return Err(QueueError::UnknownJobType(job_type));
        }
        options.validate()?;
        options.timeout.get_or_insert(self.shared.config.default_timeout);

        let job = Job::new(
            self.shared.store.next_id(),
            job_type,
            payload,
            options,
            Utc::now(),
        );
        self.submit(job)
    }

    /// Snapshot of a job.
    pub fn get_job(&self, id: JobId) -> QueueResult<Job> {
        self.shared.store.get(id)
    }

    /// Delete a job record.
    ///
    /// Returns `Ok(false)` for unknown ids. A running job is only removed with
    /// `force`; its handler is signalled and whatever it returns is dropped.
    pub fn remove_job(&self, id: JobId, force: bool) -> QueueResult<bool> {
        let removed = self.shared.store.remove_if(id, |job| {
            if job.status == JobStatus::Running && !force {
                return Err(QueueError::invalid_state(id, job.status, "remove"));
            }
            Ok(())
        });

        match removed {
            Ok(job) => {
                match job.status {
                    JobStatus::Running => self.shared.signal_cancel(id),
                    JobStatus::Pending | JobStatus::Delayed => self.shared.unqueue(id),
                    _ => {}
                }
                debug!(job_id = %id, status = %job.status, force, "job removed");
                self.shared.emit(JobEvent::Removed { job_id: id });
                Ok(true)
            }
            Err(QueueError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Re-submit a failed job as a new record. The original is left as is.
    pub fn retry(&self, id: JobId) -> QueueResult<Job> {
        let original = self.shared.store.get(id)?;
        if original.status != JobStatus::Failed {
            return Err(QueueError::invalid_state(id, original.status, "retry"));
        }

        let job = Job::retry_of(&original, self.shared.store.next_id(), Utc::now());
        info!(job_id = %job.id, retry_of = %id, job_type = %job.job_type, "job retried");
        self.submit(job)
    }

    /// Cancel a job that has not finished.
    ///
    /// Waiting jobs never start. For a running job the handler's token is
    /// cancelled and its outcome is discarded.
    pub fn cancel(&self, id: JobId) -> QueueResult<Job> {
        let waiting_or_running = [JobStatus::Pending, JobStatus::Delayed, JobStatus::Running];
        let cancelled = self
            .shared
            .store
            .compare_and_update(id, &waiting_or_running, |job| {
                let was_running = job.status == JobStatus::Running;
                job.cancel(Utc::now())?;
                Ok((job.clone(), was_running))
            })?;

        let Some((job, was_running)) = cancelled else {
            let current = self.shared.store.get(id)?;
            return Err(QueueError::invalid_state(id, current.status, "cancel"));
        };

        if was_running {
            self.shared.signal_cancel(id);
        } else {
            self.shared.unqueue(id);
        }
        debug!(job_id = %id, was_running, "job cancelled");
        self.shared.emit(JobEvent::Cancelled { job_id: id });
        Ok(job)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.shared.store.list(filter)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            jobs: self.shared.store.stats(),
            running: self.shared.config.concurrency - self.shared.permits.available_permits(),
            queued: self.shared.lock_ready().len(),
            executor: self.shared.counters.snapshot(),
        }
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    /// Stop dispatching and wait for running handlers.
    ///
    /// Handlers still running after `shutdown_grace` are cancelled. Waiting
    /// jobs stay in the store untouched.
    pub async fn shutdown(&self) {
        let name = self.shared.config.name.clone();
        self.shared.shutdown.cancel();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(queue = %name, error = %e, "dispatcher task ended abnormally");
            }
        }

        self.shared.tracker.close();
        let grace = self.shared.config.shutdown_grace;
        if tokio::time::timeout(grace, self.shared.tracker.wait()).await.is_err() {
            let stuck: Vec<JobId> = self.shared.lock_running().keys().copied().collect();
            warn!(
                queue = %name,
                running = stuck.len(),
                grace_ms = grace.as_millis() as u64,
                "shutdown grace elapsed; cancelling running jobs"
            );
            for id in stuck {
                if let Err(e) = self.cancel(id) {
                    debug!(job_id = %id, error = %e, "job finished before it could be cancelled");
                }
            }
            self.shared.tracker.wait().await;
        }

        info!(queue = %name, "job queue shut down");
    }

    fn submit(&self, job: Job) -> QueueResult<Job> {
        self.shared.store.insert(job.clone())?;

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.options.priority,
            status = %job.status,
            "job added"
        );
        self.shared.emit(JobEvent::Added {
            job_id: job.id,
            job_type: job.job_type.clone(),
            status: job.status,
        });
        // `added` must reach subscribers before the dispatcher can emit `started`.
        self.shared.enqueue(ReadyEntry::of(&job), job.run_at);
        Ok(job)
    }
}

impl<S: JobStore> Drop for JobQueue<S> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl<S: JobStore> std::fmt::Debug for JobQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.shared.config)
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}
