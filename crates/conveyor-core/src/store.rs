use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::{Result, Task};

/// Liveness report a worker pool publishes on a fixed interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub hostname: String,
    pub queue: String,
    pub concurrency: usize,
    pub active: usize,
    pub processed: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Fast key-value store for task results, worker heartbeats and application
/// cache entries.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Stores the latest view of a task. Terminal tasks expire after the
    /// store's result TTL.
    async fn save_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    async fn heartbeat(&self, heartbeat: &WorkerHeartbeat, ttl: Duration) -> Result<()>;

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>>;

    async fn cache_set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()>;

    async fn cache_get(&self, key: &str) -> Result<Option<Value>>;

    async fn cache_delete(&self, key: &str) -> Result<bool>;

    async fn last_fired(&self, entry: &str) -> Result<Option<DateTime<Utc>>>;

    async fn mark_fired(&self, entry: &str, at: DateTime<Utc>) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}
