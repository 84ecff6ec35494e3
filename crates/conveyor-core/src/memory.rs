//! In-process broker and store.
//!
//! Both follow the same contracts as the Redis implementations, so a single
//! binary can run API, beat and workers together without external services,
//! and tests can drive the whole flow deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::broker::{Broker, DeadLetter, QueueStats};
use crate::store::{ResultStore, WorkerHeartbeat};
use crate::task::DEFAULT_QUEUE;
use crate::{Result, Task};

#[derive(Default)]
struct Queues {
    ready: VecDeque<Task>,
    in_flight: HashMap<String, Task>,
    delayed: Vec<Task>,
    dead: Vec<DeadLetter>,
}

pub struct MemoryBroker {
    queue_name: String,
    queues: Mutex<Queues>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task: &Task) -> Result<()> {
        self.queues.lock().await.ready.push_back(task.clone());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Registered before checking so an enqueue in between is not missed.
            let notified = self.notify.notified();

            {
                let mut queues = self.queues.lock().await;
                if let Some(task) = queues.ready.pop_front() {
                    queues.in_flight.insert(task.id.clone(), task.clone());
                    return Ok(Some(task));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, task: &Task) -> Result<()> {
        self.queues.lock().await.in_flight.remove(&task.id);
        Ok(())
    }

    async fn retry_later(&self, task: &Task) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues.in_flight.remove(&task.id);
        queues.delayed.push(task.clone());
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let promoted = {
            let mut queues = self.queues.lock().await;
            let (due, waiting): (Vec<Task>, Vec<Task>) = std::mem::take(&mut queues.delayed)
                .into_iter()
                .partition(|task| task.eta.map_or(true, |eta| eta <= now));
            queues.delayed = waiting;
            let count = due.len();
            queues.ready.extend(due);
            count
        };

        if promoted > 0 {
            self.notify.notify_waiters();
        }
        Ok(promoted)
    }

    async fn dead_letter(&self, task: &Task, reason: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        queues.in_flight.remove(&task.id);
        queues.dead.push(DeadLetter {
            task: task.clone(),
            reason: reason.to_string(),
            moved_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let queues = self.queues.lock().await;
        Ok(queues.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn recover_in_flight(&self) -> Result<usize> {
        let recovered = {
            let mut queues = self.queues.lock().await;
            let stranded: Vec<Task> = queues.in_flight.drain().map(|(_, task)| task).collect();
            let count = stranded.len();
            for task in stranded {
                queues.ready.push_front(task);
            }
            count
        };

        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let queues = self.queues.lock().await;
        Ok(QueueStats {
            queue: self.queue_name.clone(),
            pending: queues.ready.len(),
            in_flight: queues.in_flight.len(),
            delayed: queues.delayed.len(),
            dead: queues.dead.len(),
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

pub struct MemoryStore {
    result_ttl: Duration,
    tasks: RwLock<HashMap<String, Expiring<Task>>>,
    workers: RwLock<HashMap<String, Expiring<WorkerHeartbeat>>>,
    cache: RwLock<HashMap<String, Expiring<Value>>>,
    fired: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_result_ttl(Duration::from_secs(24 * 60 * 60))
    }

    pub fn with_result_ttl(result_ttl: Duration) -> Self {
        Self {
            result_ttl,
            tasks: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            fired: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let ttl = task.state.is_terminal().then_some(self.result_ttl);
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), Expiring::new(task.clone(), ttl));
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let now = Instant::now();
        let tasks = self.tasks.read().await;
        Ok(tasks
            .get(task_id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn heartbeat(&self, heartbeat: &WorkerHeartbeat, ttl: Duration) -> Result<()> {
        self.workers.write().await.insert(
            heartbeat.worker_id.clone(),
            Expiring::new(heartbeat.clone(), Some(ttl)),
        );
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>> {
        let now = Instant::now();
        let mut workers = self.workers.write().await;
        workers.retain(|_, entry| entry.is_live(now));

        let mut live: Vec<WorkerHeartbeat> = workers.values().map(|e| e.value.clone()).collect();
        live.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(live)
    }

    async fn cache_set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        self.cache
            .write()
            .await
            .insert(key.to_string(), Expiring::new(value.clone(), ttl));
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        let cache = self.cache.read().await;
        Ok(cache
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn cache_delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .cache
            .write()
            .await
            .remove(key)
            .map_or(false, |entry| entry.is_live(now)))
    }

    async fn last_fired(&self, entry: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.fired.read().await.get(entry).copied())
    }

    async fn mark_fired(&self, entry: &str, at: DateTime<Utc>) -> Result<()> {
        self.fired.write().await.insert(entry.to_string(), at);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
