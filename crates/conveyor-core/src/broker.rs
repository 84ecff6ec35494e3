use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, Task};

/// Snapshot of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: usize,
    pub in_flight: usize,
    pub delayed: usize,
    pub dead: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.delayed + self.dead
    }
}

/// A task given up on, kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: Task,
    pub reason: String,
    pub moved_at: DateTime<Utc>,
}

/// Durable queue between producers and workers.
///
/// Delivery is at-least-once: a dequeued task stays in an in-flight set until
/// it is acked, parked for retry or dead-lettered, and
/// [`Broker::recover_in_flight`] redelivers whatever a crashed worker left.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, task: &Task) -> Result<()>;

    async fn enqueue_batch(&self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            self.enqueue(task).await?;
        }
        Ok(())
    }

    /// Waits up to `timeout` for the next ready task.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>>;

    async fn ack(&self, task: &Task) -> Result<()>;

    /// Parks the task until its `eta`.
    async fn retry_later(&self, task: &Task) -> Result<()>;

    /// Moves parked tasks whose `eta` has passed back to the ready queue.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn dead_letter(&self, task: &Task, reason: &str) -> Result<()>;

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Requeues tasks left in flight by workers that died.
    async fn recover_in_flight(&self) -> Result<usize>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn ping(&self) -> Result<()>;

    fn queue_name(&self) -> &str;
}
