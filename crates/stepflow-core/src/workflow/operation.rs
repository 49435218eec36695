//! Operation handlers: the external collaborators behind `operation` states.
//!
//! Handlers are registered per task identifier in an [`OperationRegistry`].
//! Lookups for unknown tasks resolve to a fallback handler that fails clearly
//! instead of silently succeeding.
//!
//! Same dynamic-dispatch recipe as the repository ports:
//! 1. `OperationHandler` uses RPITIT for ergonomic implementations
//! 2. `OperationHandlerDyn` is the object-safe mirror with boxed futures
//! 3. `BoxOperationHandler` wraps `Box<dyn OperationHandlerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request / error
// ---------------------------------------------------------------------------

/// Everything a handler receives for one invocation.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub run_id: Uuid,
    pub state_id: String,
    pub task: String,
    /// Input map with all `${ }` references already resolved.
    pub input: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the run is cancelled or the engine shuts down.
    /// Handlers should stop work on a best-effort basis.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationFailure {
    /// The handler ran and reported a failure. Retried per the state's policy.
    #[error("{0}")]
    Failed(String),

    /// No handler is registered for the task. Never retried.
    #[error("no handler registered for task '{0}'")]
    UnknownTask(String),

    /// The handler rejected its input. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl OperationFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OperationFailure::Failed(_))
    }
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// A task implementation, e.g. an agent invocation or an outbound HTTP call.
pub trait OperationHandler: Send + Sync {
    fn invoke(
        &self,
        request: &OperationRequest,
    ) -> impl Future<Output = Result<Value, OperationFailure>> + Send;
}

/// Object-safe version of [`OperationHandler`] with boxed futures.
pub trait OperationHandlerDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a OperationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, OperationFailure>> + Send + 'a>>;
}

impl<T: OperationHandler> OperationHandlerDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a OperationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, OperationFailure>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased operation handler.
pub struct BoxOperationHandler {
    inner: Box<dyn OperationHandlerDyn + Send + Sync>,
}

impl BoxOperationHandler {
    pub fn new<T: OperationHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn invoke(&self, request: &OperationRequest) -> Result<Value, OperationFailure> {
        self.inner.invoke_boxed(request).await
    }
}

/// Fallback for tasks nobody registered.
pub struct UnregisteredTaskHandler;

impl OperationHandler for UnregisteredTaskHandler {
    async fn invoke(&self, request: &OperationRequest) -> Result<Value, OperationFailure> {
        Err(OperationFailure::UnknownTask(request.task.clone()))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Task identifier -> handler lookup.
pub struct OperationRegistry {
    handlers: DashMap<String, Arc<BoxOperationHandler>>,
    fallback: Arc<BoxOperationHandler>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            fallback: Arc::new(BoxOperationHandler::new(UnregisteredTaskHandler)),
        }
    }

    /// Register (or replace) the handler for `task`.
    pub fn register<T: OperationHandler + 'static>(&self, task: impl Into<String>, handler: T) {
        let task = task.into();
        tracing::debug!(task = %task, "registered operation handler");
        self.handlers
            .insert(task, Arc::new(BoxOperationHandler::new(handler)));
    }

    /// Handler for `task`, or the unregistered-task fallback.
    pub fn resolve(&self, task: &str) -> Arc<BoxOperationHandler> {
        self.handlers
            .get(task)
            .map(|h| Arc::clone(h.value()))
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn is_registered(&self, task: &str) -> bool {
        self.handlers.contains_key(task)
    }

    /// Registered task identifiers, sorted.
    pub fn tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        tasks.sort();
        tasks
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
