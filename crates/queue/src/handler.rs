//! Handler-facing types: the handler trait, its error type and the per-attempt
//! context.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use jobforge_core::JobId;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error returned by a job handler.
///
/// Retryable errors consume one attempt and re-queue the job while attempts
/// remain. Permanent errors fail the job immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(msg) | HandlerError::Permanent(msg) => msg,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{err:#}"))
    }
}

// A payload that does not decode will not decode on the next attempt either.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid payload: {err}"))
    }
}

/// Async job handler.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Value, ctx: JobContext) -> Result<Value, HandlerError>;
}

/// Callback invoked with raw progress values.
#[derive(Clone)]
pub struct ProgressReporter(Arc<dyn Fn(i64) + Send + Sync>);

impl ProgressReporter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Reporter that drops every value.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, value: i64) {
        (self.0)(value)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}

/// Per-attempt execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    attempt: u32,
    progress: ProgressReporter,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        attempt: u32,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            attempt,
            progress,
            cancel,
        }
    }

    /// Context not attached to any queue, for exercising handlers directly.
    pub fn detached(job_id: JobId, attempt: u32) -> Self {
        Self::new(
            job_id,
            attempt,
            ProgressReporter::noop(),
            CancellationToken::new(),
        )
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report progress. Values are clamped to `0..=100` by the queue and
    /// ignored once the attempt is no longer current.
    pub fn report_progress(&self, value: i64) {
        self.progress.report(value);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job is cancelled, removed with `force`, timed out
    /// or abandoned at shutdown.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, payload: Value, ctx: JobContext) -> Result<Value, HandlerError> {
            ctx.report_progress(100);
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn handler_runs_with_detached_context() {
        let ctx = JobContext::detached(JobId::from(1), 1);
        let out = Echo
            .handle(serde_json::json!({"n": 1}), ctx)
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"n": 1}));
    }

    #[test]
    fn progress_reporter_forwards_values() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = JobContext::new(
            JobId::from(3),
            2,
            ProgressReporter::new(move |v| sink.lock().unwrap().push(v)),
            CancellationToken::new(),
        );

        ctx.report_progress(10);
        ctx.report_progress(250);

        assert_eq!(*seen.lock().unwrap(), vec![10, 250]);
        assert_eq!(ctx.attempt(), 2);
    }

    #[test]
    fn cancellation_is_visible_through_context() {
        let ctx = JobContext::detached(JobId::from(1), 1);
        assert!(!ctx.is_cancelled());
        ctx.cancellation_token().cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn error_conversions() {
        let err: HandlerError = anyhow::anyhow!("smtp down").into();
        assert!(err.is_retryable());
        assert_eq!(err.message(), "smtp down");

        let bad = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err: HandlerError = bad.into();
        assert!(!err.is_retryable());
    }
}
