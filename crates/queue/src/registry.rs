//! Mapping from job type names to handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::handler::{HandlerError, JobContext, JobHandler};

/// Type-erased handler callable.
pub type HandlerFn =
    Arc<dyn Fn(Value, JobContext) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

const WILDCARD: &str = "*";

/// Registry of job handlers.
///
/// Populated at startup and handed to the queue, which never mutates it.
/// Keys are either an exact type (`"email.send"`), a category pattern
/// (`"email.*"`, matching any type starting with `"email."`) or the
/// catch-all `"*"`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for `job_type`. A later registration for
    /// the same key replaces the earlier one.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(
            move |payload: Value, ctx: JobContext| -> BoxFuture<'static, Result<Value, HandlerError>> {
                Box::pin(handler(payload, ctx))
            },
        );
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F, Fut>(mut self, job_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(job_type, handler);
        self
    }

    /// Register a [`JobHandler`] implementation.
    pub fn register_handler<H: JobHandler>(
        &mut self,
        job_type: impl Into<String>,
        handler: H,
    ) -> &mut Self {
        let handler = Arc::new(handler);
        self.register(job_type, move |payload, ctx| {
            let handler = Arc::clone(&handler);
            async move { handler.handle(payload, ctx).await }
        })
    }

    /// Find the handler for `job_type`: exact match first, then the longest
    /// matching category pattern, then the catch-all.
    pub fn resolve(&self, job_type: &str) -> Option<HandlerFn> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(Arc::clone(h));
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix('*')?;
                (prefix.ends_with('.') && job_type.starts_with(prefix))
                    .then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = category {
            return Some(Arc::clone(h));
        }

        self.handlers.get(WILDCARD).map(Arc::clone)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.resolve(job_type).is_some()
    }

    /// Registered keys, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
