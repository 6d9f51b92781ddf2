//! Queue runtime configuration.

use std::time::Duration;

use jobforge_core::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::warn;

const ENV_NAME: &str = "JOBFORGE_NAME";
const ENV_CONCURRENCY: &str = "JOBFORGE_CONCURRENCY";
const ENV_DEFAULT_TIMEOUT_MS: &str = "JOBFORGE_DEFAULT_TIMEOUT_MS";
const ENV_EVENT_CAPACITY: &str = "JOBFORGE_EVENT_CAPACITY";
const ENV_SHUTDOWN_GRACE_MS: &str = "JOBFORGE_SHUTDOWN_GRACE_MS";

/// Largest buffer a broadcast channel accepts.
const MAX_EVENT_CAPACITY: usize = usize::MAX / 2;

/// Configuration for a [`JobQueue`](crate::JobQueue).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Name used in log lines
    #[serde(default = "default_name")]
    pub name: String,

    /// Maximum number of handlers running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-attempt timeout for jobs submitted without `timeoutMs`
    #[serde(
        rename = "defaultTimeoutMs",
        default = "default_timeout",
        with = "jobforge_core::serde_ms"
    )]
    pub default_timeout: Duration,

    /// Buffer size of the lifecycle event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// How long `shutdown()` waits for running handlers before cancelling them
    #[serde(
        rename = "shutdownGraceMs",
        default = "default_shutdown_grace",
        with = "jobforge_core::serde_ms"
    )]
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            concurrency: default_concurrency(),
            default_timeout: default_timeout(),
            event_capacity: default_event_capacity(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from `JOBFORGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup. Missing keys keep
    /// their defaults; unparsable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_NAME).filter(|n| !n.trim().is_empty()) {
            config.name = name;
        }

        if let Some(c) = parse_var(&lookup, ENV_CONCURRENCY) {
            config.concurrency = c;
        }

        if let Some(ms) = parse_var(&lookup, ENV_DEFAULT_TIMEOUT_MS) {
            config.default_timeout = Duration::from_millis(ms);
        }

        if let Some(c) = parse_var(&lookup, ENV_EVENT_CAPACITY) {
            config.event_capacity = c;
        }

        if let Some(ms) = parse_var(&lookup, ENV_SHUTDOWN_GRACE_MS) {
            config.shutdown_grace = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::validation("concurrency must be at least 1"));
        }
        if self.concurrency > Semaphore::MAX_PERMITS {
            return Err(QueueError::validation(format!(
                "concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.default_timeout.is_zero() {
            return Err(QueueError::validation(
                "default timeout must be greater than 0",
            ));
        }
        if self.event_capacity == 0 {
            return Err(QueueError::validation("event capacity must be at least 1"));
        }
        if self.event_capacity > MAX_EVENT_CAPACITY {
            return Err(QueueError::validation(format!(
                "event capacity must be at most {MAX_EVENT_CAPACITY}"
            )));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring unparsable config value");
            None
        }
    }
}

fn default_name() -> String {
    "jobforge".to_string()
}

fn default_concurrency() -> usize {
    5
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_event_capacity() -> usize {
    256
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}
