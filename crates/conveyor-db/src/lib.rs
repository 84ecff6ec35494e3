pub mod error;
pub mod models;
pub mod repository;

// Re-exports
pub use error::{Error, Result};
pub use models::{AggregateStats, ExecutionLog, TaskRecord};
pub use repository::Database;

use async_trait::async_trait;
use conveyor_core::health::Probe;
use conveyor_core::{SubmitHook, Task};

#[async_trait]
impl Probe for Database {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn check(&self) -> conveyor_core::Result<()> {
        Ok(self.ping().await?)
    }
}

/// Writes the queued row before the broker sees the task, so a worker's
/// later updates always land on an existing record.
#[async_trait]
impl SubmitHook for Database {
    async fn before_enqueue(&self, task: &Task) -> conveyor_core::Result<()> {
        Ok(self.save_task(task).await?)
    }
}
