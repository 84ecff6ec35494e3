use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use conveyor_core::{Task, TaskOrigin, TaskState};

use crate::{Error, Result};

/// Row of the `tasks` table. The durable history of every task, kept after
/// the result store has expired it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub state: String,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: i32,
    pub max_retries: i32,
    pub origin: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            queue: task.queue.clone(),
            state: task.state.as_str().to_string(),
            payload: task.payload.clone(),
            result: task.result.clone(),
            error: task.error.clone(),
            attempts: task.attempts as i32,
            max_retries: task.max_retries as i32,
            origin: task.origin.to_string(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            eta: task.eta,
        }
    }
}

impl TaskRecord {
    pub fn into_task(self) -> Result<Task> {
        let corrupt = |reason: String| Error::CorruptRecord {
            id: self.id.clone(),
            reason,
        };
        let state: TaskState = self.state.parse().map_err(|e| corrupt(format!("{}", e)))?;
        let origin: TaskOrigin = self.origin.parse().map_err(|e| corrupt(format!("{}", e)))?;

        Ok(Task {
            id: self.id,
            name: self.name,
            payload: self.payload,
            queue: self.queue,
            state,
            attempts: self.attempts.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            origin,
            result: self.result,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            eta: self.eta,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionLog {
    pub id: i32,
    pub task_id: String,
    pub event_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_tasks: i64,
    pub queued_tasks: i64,
    pub running_tasks: i64,
    pub retrying_tasks: i64,
    pub succeeded_tasks: i64,
    pub failed_tasks: i64,
    pub avg_runtime_ms: Option<f64>,
}
