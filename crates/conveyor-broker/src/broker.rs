//! Reliable Redis queue.
//!
//! Layout for a queue named `q`:
//!
//! - `conveyor:queue:q`: ready list, pushed on the left and popped on the right
//! - `conveyor:queue:q:in_flight:{consumer}`: tasks a consumer is running
//! - `conveyor:queue:q:consumers`: sorted set of consumers scored by their
//!   last dequeue, pruned once idle with an empty in-flight list
//! - `conveyor:queue:q:delayed`: sorted set of parked retries scored by eta
//! - `conveyor:queue:q:dead`: dead letters, newest on the left
//!
//! Each consumer owns its in-flight list, so a restarted worker only reclaims
//! what it was running itself and never steals from a live replica.
//!
//! BRPOPLPUSH holds its connection until it returns, so blocking pops run on
//! connections of their own and never stall the shared one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Pipeline};
use std::time::Duration;
use tokio::sync::Mutex;

use conveyor_core::{Broker, DeadLetter, QueueStats, Task};

use crate::keys;
use crate::{Error, Result};

/// How long a consumer with nothing in flight may go without dequeuing
/// before it is dropped from the consumers set.
pub const DEFAULT_CONSUMER_IDLE: Duration = Duration::from_secs(600);

/// Keys of one queue as seen by one consumer.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    pub ready: String,
    pub in_flight: String,
    pub consumers: String,
    pub delayed: String,
    pub dead: String,
}

impl QueueKeys {
    pub fn new(queue: &str, consumer: &str) -> Self {
        Self {
            ready: keys::ready(queue),
            in_flight: keys::in_flight(queue, consumer),
            consumers: keys::consumers(queue),
            delayed: keys::delayed(queue),
            dead: keys::dead(queue),
        }
    }

    /// Parks `raw` until `score` and drops the in-flight `entry` in one
    /// MULTI, so a failure leaves the task either in flight or parked.
    pub fn park(&self, raw: &str, score: i64, entry: Option<&str>) -> Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic().zadd(&self.delayed, raw, score).ignore();
        if let Some(entry) = entry {
            pipe.lrem(&self.in_flight, 1, entry).ignore();
        }
        pipe
    }

    /// Same as [`QueueKeys::park`] for the dead list.
    pub fn bury(&self, raw: &str, entry: Option<&str>) -> Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic().lpush(&self.dead, raw).ignore();
        if let Some(entry) = entry {
            pipe.lrem(&self.in_flight, 1, entry).ignore();
        }
        pipe
    }
}

pub struct RedisBroker {
    redis: ConnectionManager,
    client: redis::Client,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    queue: String,
    consumer: String,
    keys: QueueKeys,
    consumer_idle: Duration,
}

impl RedisBroker {
    /// Connects and binds to `queue`. `consumer` names this process's
    /// in-flight list and should survive restarts (a hostname works).
    pub async fn connect(redis_url: &str, queue: &str, consumer: &str) -> Result<Self> {
        let client = crate::client(redis_url)?;
        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self::from_parts(client, redis, queue, consumer))
    }

    /// `client` opens the connections blocking pops run on; everything
    /// else goes through `redis`.
    pub fn from_parts(
        client: redis::Client,
        redis: ConnectionManager,
        queue: &str,
        consumer: &str,
    ) -> Self {
        Self {
            redis,
            client,
            blocking: Mutex::new(Vec::new()),
            queue: queue.to_string(),
            consumer: consumer.to_string(),
            keys: QueueKeys::new(queue, consumer),
            consumer_idle: DEFAULT_CONSUMER_IDLE,
        }
    }

    pub fn with_consumer_idle(mut self, idle: Duration) -> Self {
        self.consumer_idle = idle;
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Raw in-flight entry for `task_id`. The stored JSON is the version that
    /// was dequeued, so entries are matched by id, not by value.
    async fn find_in_flight(&self, task_id: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.keys.in_flight, 0, -1).await?;

        for raw in entries {
            match serde_json::from_str::<Task>(&raw) {
                Ok(task) if task.id == task_id => return Ok(Some(raw)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %self.keys.in_flight, error = %e, "Dropping unreadable in-flight entry");
                    conn.lrem::<_, _, ()>(&self.keys.in_flight, 1, &raw).await?;
                }
            }
        }

        Ok(None)
    }

    async fn remove_in_flight(&self, task_id: &str) -> Result<bool> {
        let Some(raw) = self.find_in_flight(task_id).await? else {
            return Ok(false);
        };
        let mut conn = self.redis.clone();
        let removed: i64 = conn.lrem(&self.keys.in_flight, 1, &raw).await?;
        Ok(removed > 0)
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Connection(e.to_string()))
    }

    async fn do_enqueue_batch(&self, tasks: &[Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let serialized = tasks
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for raw in &serialized {
            pipe.lpush(&self.keys.ready, raw).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn do_dequeue(&self, timeout: Duration) -> Result<Option<Task>> {
        let mut conn = self.redis.clone();
        conn.zadd::<_, _, _, ()>(
            &self.keys.consumers,
            &self.consumer,
            Utc::now().timestamp_millis(),
        )
        .await?;

        // BRPOPLPUSH takes whole seconds; zero would block forever.
        let timeout_secs = timeout.as_secs().max(1);
        let mut blocking = self.checkout_blocking().await?;
        // A connection that errored is dropped rather than returned.
        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.keys.ready)
            .arg(&self.keys.in_flight)
            .arg(timeout_secs)
            .query_async(&mut blocking)
            .await?;
        self.blocking.lock().await.push(blocking);

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<Task>(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                conn.lrem::<_, _, ()>(&self.keys.in_flight, 1, &raw).await?;
                Err(Error::Corrupt {
                    key: self.keys.ready.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn do_retry_later(&self, task: &Task) -> Result<()> {
        let raw = serde_json::to_string(task)?;
        let score = task.eta.unwrap_or_else(Utc::now).timestamp_millis();

        let entry = self.find_in_flight(&task.id).await?;
        let mut conn = self.redis.clone();
        self.keys
            .park(&raw, score, entry.as_deref())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn do_promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = conn
            .zrangebyscore(&self.keys.delayed, "-inf", now.timestamp_millis())
            .await?;

        let mut promoted = 0;
        for raw in due {
            // Whoever removes the member owns the promotion.
            let removed: i64 = conn.zrem(&self.keys.delayed, &raw).await?;
            if removed > 0 {
                conn.lpush::<_, _, ()>(&self.keys.ready, &raw).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn do_dead_letter(&self, task: &Task, reason: &str) -> Result<()> {
        let letter = DeadLetter {
            task: task.clone(),
            reason: reason.to_string(),
            moved_at: Utc::now(),
        };
        let raw = serde_json::to_string(&letter)?;

        let entry = self.find_in_flight(&task.id).await?;
        let mut conn = self.redis.clone();
        self.keys
            .bury(&raw, entry.as_deref())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn do_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.keys.dead, 0, limit as isize - 1).await?;

        entries
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(Error::from))
            .collect()
    }

    async fn do_recover(&self) -> Result<usize> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        // Moved onto the ready list's pop end so stranded tasks run first.
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.keys.in_flight)
                .arg(&self.keys.ready)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn do_stats(&self) -> Result<QueueStats> {
        let mut conn = self.redis.clone();
        let pending: usize = conn.llen(&self.keys.ready).await?;
        let delayed: usize = conn.zcard(&self.keys.delayed).await?;
        let dead: usize = conn.llen(&self.keys.dead).await?;

        let idle_since = Utc::now().timestamp_millis() - self.consumer_idle.as_millis() as i64;
        let consumers: Vec<(String, i64)> =
            conn.zrange_withscores(&self.keys.consumers, 0, -1).await?;
        let mut in_flight = 0;
        for (consumer, last_seen) in consumers {
            let len: usize = conn.llen(keys::in_flight(&self.queue, &consumer)).await?;
            if len == 0 && last_seen <= idle_since {
                conn.zrem::<_, _, ()>(&self.keys.consumers, &consumer).await?;
                tracing::debug!(consumer = %consumer, queue = %self.queue, "Pruned idle consumer");
            }
            in_flight += len;
        }

        Ok(QueueStats {
            queue: self.queue.clone(),
            pending,
            in_flight,
            delayed,
            dead,
        })
    }

    async fn do_ping(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, task: &Task) -> conveyor_core::Result<()> {
        Ok(self.do_enqueue_batch(std::slice::from_ref(task)).await?)
    }

    async fn enqueue_batch(&self, tasks: &[Task]) -> conveyor_core::Result<()> {
        Ok(self.do_enqueue_batch(tasks).await?)
    }

    async fn dequeue(&self, timeout: Duration) -> conveyor_core::Result<Option<Task>> {
        Ok(self.do_dequeue(timeout).await?)
    }

    async fn ack(&self, task: &Task) -> conveyor_core::Result<()> {
        if !self.remove_in_flight(&task.id).await? {
            tracing::debug!(task_id = %task.id, "Ack for task not in flight");
        }
        Ok(())
    }

    async fn retry_later(&self, task: &Task) -> conveyor_core::Result<()> {
        Ok(self.do_retry_later(task).await?)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> conveyor_core::Result<usize> {
        Ok(self.do_promote_due(now).await?)
    }

    async fn dead_letter(&self, task: &Task, reason: &str) -> conveyor_core::Result<()> {
        Ok(self.do_dead_letter(task, reason).await?)
    }

    async fn dead_letters(&self, limit: usize) -> conveyor_core::Result<Vec<DeadLetter>> {
        Ok(self.do_dead_letters(limit).await?)
    }

    async fn recover_in_flight(&self) -> conveyor_core::Result<usize> {
        let recovered = self.do_recover().await?;
        if recovered > 0 {
            tracing::warn!(
                consumer = %self.consumer,
                queue = %self.queue,
                recovered,
                "Requeued tasks left in flight"
            );
        }
        Ok(recovered)
    }

    async fn stats(&self) -> conveyor_core::Result<QueueStats> {
        Ok(self.do_stats().await?)
    }

    async fn ping(&self) -> conveyor_core::Result<()> {
        Ok(self.do_ping().await?)
    }

    fn queue_name(&self) -> &str {
        &self.queue
    }
}
