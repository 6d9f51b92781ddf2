//! Scheduling order for waiting jobs.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use jobforge_core::{Job, JobId};

/// Ordering key of a waiting job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEntry {
    pub id: JobId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl ReadyEntry {
    pub fn of(job: &Job) -> Self {
        Self {
            id: job.id,
            priority: job.options.priority,
            created_at: job.created_at,
        }
    }
}

// "Greater" means "dispatch first": higher priority, then older, then lower id.
impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of job ids with support for delayed eligibility.
///
/// Cancelled and removed jobs are taken out with [`remove`](Self::remove).
/// An entry that still goes stale (its record changed behind the queue's
/// back) is skipped when popped, since the claim against the store fails.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<(DateTime<Utc>, ReadyEntry)>>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `entry`, eligible from `run_at` onwards.
    pub fn push(&mut self, entry: ReadyEntry, run_at: DateTime<Utc>, now: DateTime<Utc>) {
        if run_at <= now {
            self.ready.push(entry);
        } else {
            self.delayed.push(Reverse((run_at, entry)));
        }
    }

    /// Move every delayed entry whose `run_at` has passed into the ready
    /// heap. Returns the promoted ids.
    pub fn promote_due(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut promoted = Vec::new();
        while let Some(Reverse((run_at, _))) = self.delayed.peek() {
            if *run_at > now {
                break;
            }
            if let Some(Reverse((_, entry))) = self.delayed.pop() {
                promoted.push(entry.id);
                self.ready.push(entry);
            }
        }
        promoted
    }

    /// Best eligible entry, if any.
    pub fn pop(&mut self) -> Option<ReadyEntry> {
        self.ready.pop()
    }

    /// Drop the entry of `id`, wherever it waits. Returns whether one was found.
    pub fn remove(&mut self, id: JobId) -> bool {
        let before = self.len();
        self.ready.retain(|e| e.id != id);
        self.delayed.retain(|Reverse((_, e))| e.id != id);
        self.len() < before
    }

    /// Earliest `run_at` among delayed entries.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.delayed.peek().map(|Reverse((run_at, _))| *run_at)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
