//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jobforge_core::{Job, JobId, JobIdSequence, JobStatus, QueueError, QueueResult};
use serde::{Deserialize, Serialize};

/// Job store abstraction.
///
/// Every method observes and commits whole records; callers never see a
/// half-applied transition.
pub trait JobStore: Send + Sync + 'static {
    /// Allocate a fresh id. Ids are never reused, even after removal.
    fn next_id(&self) -> JobId;

    /// Store a new record.
    fn insert(&self, job: Job) -> QueueResult<JobId>;

    /// Snapshot of a record.
    fn get(&self, id: JobId) -> QueueResult<Job>;

    /// Remove a record if `check` accepts its current state.
    fn remove_if<F>(&self, id: JobId, check: F) -> QueueResult<Job>
    where
        F: FnOnce(&Job) -> QueueResult<()>;

    /// Remove a record unconditionally.
    fn remove(&self, id: JobId) -> QueueResult<Job> {
        self.remove_if(id, |_| Ok(()))
    }

    /// Atomic status-guarded transition.
    ///
    /// Returns `Ok(None)` when the record's status is not in `expected`.
    /// `mutate` runs against a copy which is committed only if it returns
    /// `Ok`; an `Err` leaves the stored record untouched and is passed
    /// through.
    fn compare_and_update<F, R>(
        &self,
        id: JobId,
        expected: &[JobStatus],
        mutate: F,
    ) -> QueueResult<Option<R>>
    where
        F: FnOnce(&mut Job) -> QueueResult<R>;

    /// Records matching `filter`, oldest first.
    fn list(&self, filter: &JobFilter) -> Vec<Job>;

    /// Record counts per status.
    fn stats(&self) -> JobStats;
}

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self
                .job_type
                .as_deref()
                .is_none_or(|t| job.job_type == t)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub delayed: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.delayed + self.running + self.completed + self.failed + self.cancelled
    }

    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Delayed => self.delayed += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    ids: JobIdSequence,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // Records are only ever replaced whole, so a panic elsewhere while the
    // lock was held cannot leave a torn record behind.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobStore for InMemoryJobStore {
    fn next_id(&self) -> JobId {
        self.ids.next()
    }

    fn insert(&self, job: Job) -> QueueResult<JobId> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, id: JobId) -> QueueResult<Job> {
        self.read().get(&id).cloned().ok_or(QueueError::NotFound(id))
    }

    fn remove_if<F>(&self, id: JobId, check: F) -> QueueResult<Job>
    where
        F: FnOnce(&Job) -> QueueResult<()>,
    {
        let mut jobs = self.write();
        let job = jobs.get(&id).ok_or(QueueError::NotFound(id))?;
        check(job)?;
        jobs.remove(&id).ok_or(QueueError::NotFound(id))
    }

    fn compare_and_update<F, R>(
        &self,
        id: JobId,
        expected: &[JobStatus],
        mutate: F,
    ) -> QueueResult<Option<R>>
    where
        F: FnOnce(&mut Job) -> QueueResult<R>,
    {
        let mut jobs = self.write();
        let current = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if !expected.contains(&current.status) {
            return Ok(None);
        }

        let mut next = current.clone();
        let out = mutate(&mut next)?;
        *current = next;
        Ok(Some(out))
    }

    fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.read();
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        result
    }

    fn stats(&self) -> JobStats {
        let jobs = self.read();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status);
        }
        stats
    }
}

impl<S: JobStore> JobStore for Arc<S> {
    fn next_id(&self) -> JobId {
        (**self).next_id()
    }

    fn insert(&self, job: Job) -> QueueResult<JobId> {
        (**self).insert(job)
    }

    fn get(&self, id: JobId) -> QueueResult<Job> {
        (**self).get(id)
    }

    fn remove_if<F>(&self, id: JobId, check: F) -> QueueResult<Job>
    where
        F: FnOnce(&Job) -> QueueResult<()>,
    {
        (**self).remove_if(id, check)
    }

    fn compare_and_update<F, R>(
        &self,
        id: JobId,
        expected: &[JobStatus],
        mutate: F,
    ) -> QueueResult<Option<R>>
    where
        F: FnOnce(&mut Job) -> QueueResult<R>,
    {
        (**self).compare_and_update(id, expected, mutate)
    }

    fn list(&self, filter: &JobFilter) -> Vec<Job> {
        (**self).list(filter)
    }

    fn stats(&self) -> JobStats {
        (**self).stats()
    }
}
