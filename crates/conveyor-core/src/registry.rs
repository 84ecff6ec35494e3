use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::store::ResultStore;
use crate::{Error, Result};

/// Outcome of a failed handler run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Worth running again after backoff.
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help (bad payload, invariant broken).
    #[error("{0}")]
    Fatal(String),
}

impl TaskError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        TaskError::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        TaskError::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable(_))
    }
}

/// Per-run information handed to a handler.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub attempt: u32,
    pub worker_id: String,
    pub store: Arc<dyn ResultStore>,
    shutdown: watch::Receiver<bool>,
}

impl TaskContext {
    /// Context with no shutdown signal attached; `cancelled` never resolves.
    pub fn new(
        task_id: impl Into<String>,
        attempt: u32,
        worker_id: impl Into<String>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let (_, shutdown) = watch::channel(false);
        Self {
            task_id: task_id.into(),
            attempt,
            worker_id: worker_id.into(),
            store,
            shutdown,
        }
    }

    /// Ties the context to a worker's shutdown flag.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the worker running this task starts shutting down.
    /// Long handlers race their work against it.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        let detached = shutdown.wait_for(|stop| *stop).await.is_err();
        if detached {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &TaskContext, payload: Value) -> std::result::Result<Value, TaskError>;
}

/// Name to handler lookup shared by producers (validation) and workers (dispatch).
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the handlers from [`crate::builtin`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_all(&mut registry);
        registry
    }

    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> Result<()>
    where
        H: TaskHandler + 'static,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(Error::DuplicateHandler(name));
        }
        tracing::debug!(task = %name, "Registered task handler");
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn run(&self, _ctx: &TaskContext, _payload: Value) -> std::result::Result<Value, TaskError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register("noop", Noop).unwrap();

        let err = registry.register("noop", Noop).unwrap_err();
        assert!(matches!(err, Error::DuplicateHandler(name) if name == "noop"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_follows_shutdown_flag() {
        let (tx, rx) = watch::channel(false);
        let ctx = TaskContext::new("t", 1, "w", Arc::new(crate::MemoryStore::new())).with_shutdown(rx);
        assert!(!ctx.is_cancelled());

        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.cancelled().await }
        });
        tx.send_replace(true);

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_context_is_never_cancelled() {
        let ctx = TaskContext::new("t", 1, "w", Arc::new(crate::MemoryStore::new()));
        let waited = tokio::time::timeout(std::time::Duration::from_secs(60), ctx.cancelled()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_builtins_present() {
        let registry = TaskRegistry::with_builtins();
        for name in ["add", "cache.put", "echo", "sleep"] {
            assert!(registry.contains(name), "missing builtin {}", name);
        }
        assert_eq!(registry.names(), vec!["add", "cache.put", "echo", "sleep"]);
    }
}
