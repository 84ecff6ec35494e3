use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::broker::{Broker, QueueStats};
use crate::registry::TaskRegistry;
use crate::store::{ResultStore, WorkerHeartbeat};
use crate::{Error, Result, Task, TaskOrigin};

/// What a producer asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl SubmitRequest {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            queue: None,
            max_retries: None,
        }
    }
}

/// Runs after the task is recorded in the store and before it reaches the
/// broker, so whatever it writes exists before any worker can update it.
#[async_trait]
pub trait SubmitHook: Send + Sync {
    async fn before_enqueue(&self, task: &Task) -> Result<()>;
}

/// Producer-side facade over broker and result store, shared by the API,
/// the CLI and the beat.
#[derive(Clone)]
pub struct Conveyor {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    registry: Option<Arc<TaskRegistry>>,
    hooks: Vec<Arc<dyn SubmitHook>>,
    default_max_retries: u32,
}

impl Conveyor {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            broker,
            store,
            registry: None,
            hooks: Vec::new(),
            default_max_retries: crate::RetryPolicy::default().max_retries,
        }
    }

    /// Rejects unknown task names at submit time instead of at execution.
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Hook failures are logged and do not stop the submission.
    pub fn with_submit_hook(mut self, hook: Arc<dyn SubmitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn registry(&self) -> Option<&Arc<TaskRegistry>> {
        self.registry.as_ref()
    }

    pub fn queue_name(&self) -> &str {
        self.broker.queue_name()
    }

    /// Builds a task from the request and enqueues it.
    pub async fn submit(&self, request: SubmitRequest, origin: TaskOrigin) -> Result<Task> {
        let task = Task::new(request.name, request.payload)
            .with_queue(request.queue.unwrap_or_else(|| self.queue_name().to_string()))
            .with_max_retries(request.max_retries.unwrap_or(self.default_max_retries))
            .with_origin(origin);

        self.submit_task(task).await
    }

    /// Records the task as queued and hands it to the broker.
    pub async fn submit_task(&self, task: Task) -> Result<Task> {
        if let Some(registry) = &self.registry {
            if !registry.contains(&task.name) {
                return Err(Error::UnknownTask(task.name));
            }
        }
        if task.queue != self.queue_name() {
            return Err(Error::UnknownQueue(task.queue));
        }

        // Stored first so a fast worker never finds a result without a record.
        self.store.save_task(&task).await?;
        for hook in &self.hooks {
            if let Err(e) = hook.before_enqueue(&task).await {
                tracing::warn!(task_id = %task.id, error = %e, "Submit hook failed");
            }
        }
        self.broker.enqueue(&task).await?;

        tracing::info!(
            task_id = %task.id,
            task = %task.name,
            queue = %task.queue,
            origin = %task.origin,
            "Task enqueued"
        );

        Ok(task)
    }

    pub async fn status(&self, task_id: &str) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerHeartbeat>> {
        self.store.workers().await
    }

    pub async fn statistics(&self) -> Result<EngineStatistics> {
        let queue = self.broker.stats().await?;
        let workers = self.store.workers().await?;

        Ok(EngineStatistics {
            live_workers: workers.len(),
            worker_slots: workers.iter().map(|w| w.concurrency).sum(),
            active_tasks: workers.iter().map(|w| w.active).sum(),
            processed: workers.iter().map(|w| w.processed).sum(),
            failed: workers.iter().map(|w| w.failed).sum(),
            queue,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub queue: QueueStats,
    pub live_workers: usize,
    pub worker_slots: usize,
    pub active_tasks: usize,
    pub processed: u64,
    pub failed: u64,
}
