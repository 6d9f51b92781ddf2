//! Per-job submission options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{QueueError, QueueResult};

/// Options supplied with `add()`.
///
/// Durations travel as integer milliseconds; every field is optional on the
/// wire and falls back to the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Higher values are dispatched first.
    pub priority: i32,
    /// Wait before the first attempt becomes eligible.
    #[serde(with = "crate::serde_ms")]
    pub delay: Duration,
    /// Per-attempt timeout. Left unset, the queue's default is filled in at
    /// submission time.
    #[serde(
        rename = "timeoutMs",
        with = "crate::serde_ms::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::ZERO,
            timeout: None,
            max_attempts: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::validation("maxAttempts must be at least 1"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(QueueError::validation("timeoutMs must be greater than 0"));
        }
        self.backoff.validate()
    }
}
