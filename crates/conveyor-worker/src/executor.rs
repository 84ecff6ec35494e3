//! Runs one delivered task to its next state.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use conveyor_core::{
    Broker, ResultStore, RetryPolicy, Task, TaskContext, TaskError, TaskRegistry, TaskState,
};
use conveyor_db::Database;

use crate::Result;

/// Where a delivery left the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retrying,
    Failed,
    /// Already finished by an earlier delivery; acked without running.
    Duplicate,
}

pub struct Executor {
    worker_id: String,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    registry: Arc<TaskRegistry>,
    db: Option<Arc<Database>>,
    retry: RetryPolicy,
    task_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Executor {
    pub fn new(
        worker_id: impl Into<String>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            broker,
            store,
            registry,
            db: None,
            retry: RetryPolicy::default(),
            task_timeout: Duration::from_secs(300),
            shutdown: watch::channel(false).1,
        }
    }

    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_task_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    /// Handlers see this flag through [`TaskContext::cancelled`].
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn execute(&self, mut task: Task) -> Result<Outcome> {
        // At-least-once delivery can hand back a task whose ack was lost.
        if let Some(known) = self.store.get_task(&task.id).await? {
            if known.state.is_terminal() {
                tracing::info!(task_id = %task.id, state = %known.state, "Skipping finished task");
                self.broker.ack(&task).await?;
                return Ok(Outcome::Duplicate);
            }
        }

        if let Err(e) = task.start() {
            let reason = e.to_string();
            tracing::error!(task_id = %task.id, error = %reason, "Undeliverable task");
            self.broker.dead_letter(&task, &reason).await?;
            return Ok(Outcome::Failed);
        }
        self.record(&task, "STARTED", &format!("attempt {} on {}", task.attempts, self.worker_id))
            .await?;

        tracing::info!(
            worker_id = %self.worker_id,
            task_id = %task.id,
            task = %task.name,
            attempt = task.attempts,
            "Running task"
        );

        let Some(handler) = self.registry.get(&task.name) else {
            let reason = format!("no handler registered for '{}'", task.name);
            return self.give_up(task, reason).await;
        };

        let ctx = TaskContext::new(
            task.id.clone(),
            task.attempts,
            self.worker_id.clone(),
            Arc::clone(&self.store),
        )
        .with_shutdown(self.shutdown.clone());

        let started = Instant::now();
        let run = AssertUnwindSafe(handler.run(&ctx, task.payload.clone())).catch_unwind();
        let result = match tokio::time::timeout(self.task_timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TaskError::fatal("handler panicked")),
            Err(_) => Err(TaskError::retryable(format!(
                "timed out after {:?}",
                self.task_timeout
            ))),
        };
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                task.succeed(value)?;
                self.record(&task, "SUCCEEDED", &format!("finished in {} ms", elapsed.as_millis()))
                    .await?;
                self.broker.ack(&task).await?;
                tracing::info!(
                    task_id = %task.id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Task succeeded"
                );
                Ok(Outcome::Succeeded)
            }
            Err(TaskError::Retryable(reason)) if task.has_retries_left() => {
                let eta = self.retry.next_eta(task.attempts, Utc::now());
                task.retry_at(reason.clone(), eta)?;
                self.record(&task, "RETRYING", &format!("{}; next run at {}", reason, eta))
                    .await?;
                self.broker.retry_later(&task).await?;
                tracing::warn!(
                    task_id = %task.id,
                    attempt = task.attempts,
                    eta = %eta,
                    error = %reason,
                    "Task will be retried"
                );
                Ok(Outcome::Retrying)
            }
            Err(TaskError::Retryable(reason)) => {
                self.give_up(task, format!("retries exhausted: {}", reason)).await
            }
            Err(TaskError::Fatal(reason)) => self.give_up(task, reason).await,
        }
    }

    async fn give_up(&self, mut task: Task, reason: String) -> Result<Outcome> {
        task.fail(reason.clone())?;
        self.record(&task, "FAILED", &reason).await?;
        self.broker.dead_letter(&task, &reason).await?;
        tracing::error!(task_id = %task.id, task = %task.name, error = %reason, "Task failed");
        Ok(Outcome::Failed)
    }

    /// Publishes the task's state. The result store is authoritative; the
    /// history database is best effort.
    async fn record(&self, task: &Task, event: &str, message: &str) -> Result<()> {
        self.store.save_task(task).await?;

        if let Some(db) = &self.db {
            if let Err(e) = db.save_task(task).await {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to persist task");
                return Ok(());
            }
            if let Err(e) = db.add_execution_log(&task.id, event, message).await {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to write execution log");
            }
        }
        Ok(())
    }
}

impl Outcome {
    pub fn state(&self) -> Option<TaskState> {
        match self {
            Outcome::Succeeded => Some(TaskState::Succeeded),
            Outcome::Retrying => Some(TaskState::Retrying),
            Outcome::Failed => Some(TaskState::Failed),
            Outcome::Duplicate => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_core::{MemoryBroker, MemoryStore};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: AtomicU32,
    }

    #[async_trait]
    impl conveyor_core::TaskHandler for Flaky {
        async fn run(&self, _ctx: &TaskContext, _payload: Value) -> std::result::Result<Value, TaskError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TaskError::retryable("not yet"));
            }
            Ok(json!("done"))
        }
    }

    struct Panics;

    #[async_trait]
    impl conveyor_core::TaskHandler for Panics {
        async fn run(&self, _ctx: &TaskContext, _payload: Value) -> std::result::Result<Value, TaskError> {
            panic!("boom")
        }
    }

    struct Fixture {
        broker: Arc<MemoryBroker>,
        store: Arc<MemoryStore>,
        executor: Executor,
    }

    fn fixture(registry: TaskRegistry) -> Fixture {
        let broker = Arc::new(MemoryBroker::default());
        let store = Arc::new(MemoryStore::new());
        let executor = Executor::new("test-worker", broker.clone(), store.clone(), Arc::new(registry))
            .with_task_timeout(Duration::from_millis(200));
        Fixture { broker, store, executor }
    }

    async fn deliver(fixture: &Fixture, task: Task) -> Task {
        fixture.store.save_task(&task).await.unwrap();
        fixture.broker.enqueue(&task).await.unwrap();
        fixture
            .broker
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let f = fixture(TaskRegistry::with_builtins());
        let task = deliver(&f, Task::new("echo", json!({"a": 1}))).await;

        assert_eq!(f.executor.execute(task.clone()).await.unwrap(), Outcome::Succeeded);

        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Succeeded);
        assert_eq!(stored.result, Some(json!({"a": 1})));
        assert_eq!(f.broker.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_retryable_error_parks_task() {
        let mut registry = TaskRegistry::new();
        registry
            .register("flaky", Flaky { failures: AtomicU32::new(1) })
            .unwrap();
        let f = fixture(registry);
        let task = deliver(&f, Task::new("flaky", Value::Null)).await;

        assert_eq!(f.executor.execute(task.clone()).await.unwrap(), Outcome::Retrying);

        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Retrying);
        assert_eq!(stored.attempts, 1);
        assert!(stored.eta.is_some());

        let stats = f.broker.stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let mut registry = TaskRegistry::new();
        registry
            .register("flaky", Flaky { failures: AtomicU32::new(10) })
            .unwrap();
        let f = fixture(registry);
        let task = deliver(&f, Task::new("flaky", Value::Null).with_max_retries(0)).await;

        assert_eq!(f.executor.execute(task.clone()).await.unwrap(), Outcome::Failed);

        let dead = f.broker.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("retries exhausted"));
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let f = fixture(TaskRegistry::with_builtins());
        let task = deliver(&f, Task::new("add", json!({"values": "nope"}))).await;

        assert_eq!(f.executor.execute(task.clone()).await.unwrap(), Outcome::Failed);

        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(f.broker.stats().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn test_unknown_task_is_dead_lettered() {
        let f = fixture(TaskRegistry::new());
        let task = deliver(&f, Task::new("missing", Value::Null)).await;

        assert_eq!(f.executor.execute(task).await.unwrap(), Outcome::Failed);

        let dead = f.broker.dead_letters(1).await.unwrap();
        assert!(dead[0].reason.contains("missing"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable() {
        let f = fixture(TaskRegistry::with_builtins());
        let task = deliver(&f, Task::new("sleep", json!({"millis": 5_000}))).await;

        assert_eq!(f.executor.execute(task.clone()).await.unwrap(), Outcome::Retrying);
        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert!(stored.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_task() {
        let mut registry = TaskRegistry::new();
        registry.register("panics", Panics).unwrap();
        let f = fixture(registry);
        let task = deliver(&f, Task::new("panics", Value::Null)).await;

        assert_eq!(f.executor.execute(task).await.unwrap(), Outcome::Failed);
    }

    #[tokio::test]
    async fn test_finished_task_is_not_rerun() {
        let f = fixture(TaskRegistry::with_builtins());
        let task = deliver(&f, Task::new("echo", Value::Null)).await;

        let mut finished = task.clone();
        finished.start().unwrap();
        finished.succeed(json!("first")).unwrap();
        f.store.save_task(&finished).await.unwrap();

        assert_eq!(f.executor.execute(task.clone()).await.unwrap(), Outcome::Duplicate);
        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.result, Some(json!("first")));
        assert_eq!(f.broker.stats().await.unwrap().in_flight, 0);
    }
}
