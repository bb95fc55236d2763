//! Job handler registry.
//!
//! Handlers are registered once at startup through [`JobRegistryBuilder`]; the built
//! [`JobRegistry`] is immutable and shared by the worker pool and the scheduler.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::job::{JobContext, JobOutcome};

/// Business logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one attempt.
    ///
    /// Return [`JobOutcome::Retryable`] for transient failures and
    /// [`JobOutcome::Fatal`] for permanent ones. Long-running handlers should watch
    /// [`JobContext::cancelled`] and return [`JobOutcome::Cancelled`] when it fires.
    async fn run(&self, ctx: JobContext) -> JobOutcome;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn JobHandler>,
    /// At most one instance of the type may run at a time
    exclusive: bool,
}

/// Collects handlers before the engine starts.
#[derive(Default)]
pub struct JobRegistryBuilder {
    handlers: HashMap<String, Registration>,
}

impl JobRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `job_type`.
    pub fn register(self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.insert(job_type.into(), handler, false)
    }

    /// Register a handler whose instances never run concurrently with each other.
    pub fn register_exclusive(
        self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        self.insert(job_type.into(), handler, true)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Make an already registered type exclusive, whichever handler it has.
    /// Unknown types are left alone.
    pub fn mark_exclusive(mut self, job_type: &str) -> Self {
        if let Some(registration) = self.handlers.get_mut(job_type) {
            registration.exclusive = true;
        }
        self
    }

    fn insert(mut self, job_type: String, handler: Arc<dyn JobHandler>, exclusive: bool) -> Self {
        if self.handlers.contains_key(&job_type) {
            tracing::warn!(job_type = %job_type, "Replacing previously registered job handler");
        }
        self.handlers
            .insert(job_type, Registration { handler, exclusive });
        self
    }

    pub fn build(self) -> JobRegistry {
        tracing::debug!(handlers = self.handlers.len(), "Job registry built");
        JobRegistry {
            handlers: self.handlers,
        }
    }
}

/// Read-only map from job type to handler.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Registration>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::new()
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|r| Arc::clone(&r.handler))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn is_exclusive(&self, job_type: &str) -> bool {
        self.handlers.get(job_type).map_or(false, |r| r.exclusive)
    }

    /// Registered type names, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
