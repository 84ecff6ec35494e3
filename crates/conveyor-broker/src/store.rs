use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;

use conveyor_core::{ResultStore, Task, WorkerHeartbeat};

use crate::keys;
use crate::{Error, Result};

/// Result backend on Redis. Terminal task records expire after
/// `result_ttl`; live ones are kept until they finish.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    result_ttl: Duration,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, result_ttl: Duration) -> Result<Self> {
        let redis = crate::connect(redis_url).await?;
        Ok(Self::from_connection(redis, result_ttl))
    }

    pub fn from_connection(redis: ConnectionManager, result_ttl: Duration) -> Self {
        Self { redis, result_ttl }
    }

    /// SET with an optional expiry. Built by hand because the typed `set_ex`
    /// argument width changes between redis releases.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Error::from)
    }

    async fn do_save_task(&self, task: &Task) -> Result<()> {
        let ttl = task.state.is_terminal().then_some(self.result_ttl);
        self.set(&keys::task(&task.id), serde_json::to_string(task)?, ttl)
            .await
    }

    async fn do_heartbeat(&self, heartbeat: &WorkerHeartbeat, ttl: Duration) -> Result<()> {
        self.set(
            &keys::worker(&heartbeat.worker_id),
            serde_json::to_string(heartbeat)?,
            Some(ttl),
        )
        .await?;

        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(keys::workers(), &heartbeat.worker_id)
            .await?;
        Ok(())
    }

    async fn do_workers(&self) -> Result<Vec<WorkerHeartbeat>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(keys::workers()).await?;

        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_json::<WorkerHeartbeat>(&keys::worker(&id)).await? {
                Some(heartbeat) => live.push(heartbeat),
                None => {
                    // Heartbeat expired; the worker is gone.
                    conn.srem::<_, _, ()>(keys::workers(), &id).await?;
                }
            }
        }

        live.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(live)
    }

    async fn do_cache_delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(keys::cache(key)).await?;
        Ok(removed > 0)
    }

    async fn do_last_fired(&self, entry: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.hget(keys::beat_last_fired(), entry).await?;
        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| Error::Corrupt {
                    key: format!("{}/{}", keys::beat_last_fired(), entry),
                    reason: e.to_string(),
                })
        })
        .transpose()
    }

    async fn do_mark_fired(&self, entry: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(keys::beat_last_fired(), entry, at.to_rfc3339())
            .await?;
        Ok(())
    }

    async fn do_ping(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for RedisStore {
    async fn save_task(&self, task: &Task) -> conveyor_core::Result<()> {
        Ok(self.do_save_task(task).await?)
    }

    async fn get_task(&self, task_id: &str) -> conveyor_core::Result<Option<Task>> {
        Ok(self.get_json(&keys::task(task_id)).await?)
    }

    async fn heartbeat(
        &self,
        heartbeat: &WorkerHeartbeat,
        ttl: Duration,
    ) -> conveyor_core::Result<()> {
        Ok(self.do_heartbeat(heartbeat, ttl).await?)
    }

    async fn workers(&self) -> conveyor_core::Result<Vec<WorkerHeartbeat>> {
        Ok(self.do_workers().await?)
    }

    async fn cache_set(
        &self,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> conveyor_core::Result<()> {
        let raw = serde_json::to_string(value)?;
        Ok(self.set(&keys::cache(key), raw, ttl).await?)
    }

    async fn cache_get(&self, key: &str) -> conveyor_core::Result<Option<Value>> {
        Ok(self.get_json(&keys::cache(key)).await?)
    }

    async fn cache_delete(&self, key: &str) -> conveyor_core::Result<bool> {
        Ok(self.do_cache_delete(key).await?)
    }

    async fn last_fired(&self, entry: &str) -> conveyor_core::Result<Option<DateTime<Utc>>> {
        Ok(self.do_last_fired(entry).await?)
    }

    async fn mark_fired(&self, entry: &str, at: DateTime<Utc>) -> conveyor_core::Result<()> {
        Ok(self.do_mark_fired(entry, at).await?)
    }

    async fn ping(&self) -> conveyor_core::Result<()> {
        Ok(self.do_ping().await?)
    }
}
