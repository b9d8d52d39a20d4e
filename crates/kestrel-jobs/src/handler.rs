//! Job handlers and their registry.

use crate::error::JobError;
use crate::job::JobContext;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Processes jobs of one type.
///
/// Returning `Err` fails the attempt and hands it to the retry policy.
/// Return [`JobError::Permanent`] for failures a retry cannot fix.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process a job.
    async fn handle(&self, ctx: JobContext, payload: Vec<u8>) -> Result<(), JobError>;
}

/// Handler function type.
pub type HandlerFn =
    dyn Fn(JobContext, Vec<u8>) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync;

/// Adapts a closure into a [`JobHandler`].
pub struct FnHandler {
    f: Box<HandlerFn>,
}

impl FnHandler {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(JobContext, Vec<u8>) -> BoxFuture<'static, Result<(), JobError>>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn handle(&self, ctx: JobContext, payload: Vec<u8>) -> Result<(), JobError> {
        (self.f)(ctx, payload).await
    }
}

/// Registered handlers keyed by job type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `job_type`.
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        info!(job_type = %job_type, "Registered job handler");
        self.handlers.write().insert(job_type, handler);
    }

    /// Look up the handler for `job_type`.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(job_type).cloned()
    }

    /// Returns true if a handler is registered for `job_type`.
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.read().contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}
