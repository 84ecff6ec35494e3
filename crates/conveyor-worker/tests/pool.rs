use async_trait::async_trait;
use serde_json::{json, Value};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::{
    Broker, Conveyor, MemoryBroker, MemoryStore, ResultStore, RetryPolicy, SubmitRequest, Task,
    TaskContext, TaskError, TaskHandler, TaskOrigin, TaskRegistry, TaskState, WorkerHeartbeat,
};
use conveyor_worker::{Executor, WorkerPool, WorkerPoolConfig};

struct FailsTwice {
    calls: AtomicU32,
}

#[async_trait]
impl TaskHandler for FailsTwice {
    async fn run(&self, ctx: &TaskContext, _payload: Value) -> Result<Value, TaskError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= 2 {
            return Err(TaskError::retryable(format!("flaky call {}", call)));
        }
        Ok(json!({ "attempt": ctx.attempt }))
    }
}

struct Harness {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
    conveyor: Conveyor,
    pool: WorkerPool,
}

fn harness() -> Harness {
    let broker = Arc::new(MemoryBroker::default());
    let store = Arc::new(MemoryStore::new());

    let mut registry = TaskRegistry::with_builtins();
    registry
        .register("fails_twice", FailsTwice { calls: AtomicU32::new(0) })
        .unwrap();
    let registry = Arc::new(registry);

    let retry = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
    };
    let executor = Executor::new("it-worker", broker.clone(), store.clone(), registry.clone())
        .with_retry_policy(retry)
        .with_task_timeout(Duration::from_secs(2));

    let config = WorkerPoolConfig::new("it-worker")
        .with_concurrency(2)
        .with_poll_interval(Duration::from_millis(20))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_shutdown_timeout(Duration::from_secs(5));

    let conveyor = Conveyor::new(broker.clone(), store.clone()).with_registry(registry);
    let pool = WorkerPool::new(config, broker.clone(), store.clone(), executor);

    Harness {
        broker,
        store,
        conveyor,
        pool,
    }
}

async fn wait_for_state(store: &MemoryStore, id: &str, state: TaskState) -> Task {
    for _ in 0..200 {
        if let Some(task) = store.get_task(id).await.unwrap() {
            if task.state == state {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached {}", id, state);
}

#[tokio::test]
async fn test_submitted_task_runs_to_success() {
    let mut h = harness();
    h.pool.start().await.unwrap();

    let task = h
        .conveyor
        .submit(SubmitRequest::new("add", json!({"values": [1, 2, 3.5]})), TaskOrigin::Api)
        .await
        .unwrap();

    let done = wait_for_state(&h.store, &task.id, TaskState::Succeeded).await;
    assert_eq!(done.result, Some(json!({"sum": 6.5})));
    assert_eq!(done.attempts, 1);

    h.pool.shutdown().await.unwrap();
    assert_eq!(h.pool.stats().succeeded, 1);
}

#[tokio::test]
async fn test_retryable_failures_are_retried_with_backoff() {
    let mut h = harness();
    h.pool.start().await.unwrap();

    let task = h
        .conveyor
        .submit(SubmitRequest::new("fails_twice", Value::Null), TaskOrigin::Cli)
        .await
        .unwrap();

    let done = wait_for_state(&h.store, &task.id, TaskState::Succeeded).await;
    assert_eq!(done.attempts, 3);
    assert_eq!(done.result, Some(json!({"attempt": 3})));

    h.pool.shutdown().await.unwrap();
    let stats = h.pool.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn test_start_recovers_stranded_tasks() {
    let mut h = harness();

    // A previous process dequeued this task and died before finishing it.
    let task = Task::new("echo", json!("survivor"));
    h.store.save_task(&task).await.unwrap();
    h.broker.enqueue(&task).await.unwrap();
    h.broker.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
    assert_eq!(h.broker.stats().await.unwrap().in_flight, 1);

    h.pool.start().await.unwrap();
    let done = wait_for_state(&h.store, &task.id, TaskState::Succeeded).await;
    assert_eq!(done.result, Some(json!("survivor")));

    h.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_is_published_and_pool_lifecycle_is_checked() {
    let mut h = harness();
    h.pool.start().await.unwrap();
    assert!(matches!(
        h.pool.start().await,
        Err(conveyor_worker::Error::AlreadyRunning)
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let workers = h.store.workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_id, "it-worker");
    assert_eq!(workers[0].concurrency, 2);

    h.pool.shutdown().await.unwrap();
    assert!(matches!(
        h.pool.shutdown().await,
        Err(conveyor_worker::Error::NotRunning)
    ));
}

#[tokio::test]
async fn test_shutdown_interrupts_sleeping_task() {
    let mut h = harness();
    h.pool.start().await.unwrap();

    let task = h
        .conveyor
        .submit(SubmitRequest::new("sleep", json!({"millis": 600_000})), TaskOrigin::Api)
        .await
        .unwrap();
    wait_for_state(&h.store, &task.id, TaskState::Running).await;

    // Well under the sleep; the handler has to give up on its own.
    tokio::time::timeout(Duration::from_secs(3), h.pool.shutdown())
        .await
        .expect("shutdown waited out the sleep")
        .unwrap();

    let parked = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(parked.state, TaskState::Retrying);
    assert!(parked.error.unwrap().contains("shutdown"));

    let stats = h.broker.stats().await.unwrap();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.delayed, 1);
}

/// Result store whose task writes can be switched off.
struct UnreliableStore {
    inner: MemoryStore,
    failing: AtomicBool,
    failed_writes: AtomicU32,
}

#[async_trait]
impl ResultStore for UnreliableStore {
    async fn save_task(&self, task: &Task) -> conveyor_core::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(conveyor_core::Error::Store("connection reset".to_string()));
        }
        self.inner.save_task(task).await
    }

    async fn get_task(&self, task_id: &str) -> conveyor_core::Result<Option<Task>> {
        self.inner.get_task(task_id).await
    }

    async fn heartbeat(&self, heartbeat: &WorkerHeartbeat, ttl: Duration) -> conveyor_core::Result<()> {
        self.inner.heartbeat(heartbeat, ttl).await
    }

    async fn workers(&self) -> conveyor_core::Result<Vec<WorkerHeartbeat>> {
        self.inner.workers().await
    }

    async fn cache_set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> conveyor_core::Result<()> {
        self.inner.cache_set(key, value, ttl).await
    }

    async fn cache_get(&self, key: &str) -> conveyor_core::Result<Option<Value>> {
        self.inner.cache_get(key).await
    }

    async fn cache_delete(&self, key: &str) -> conveyor_core::Result<bool> {
        self.inner.cache_delete(key).await
    }

    async fn last_fired(&self, entry: &str) -> conveyor_core::Result<Option<DateTime<Utc>>> {
        self.inner.last_fired(entry).await
    }

    async fn mark_fired(&self, entry: &str, at: DateTime<Utc>) -> conveyor_core::Result<()> {
        self.inner.mark_fired(entry, at).await
    }

    async fn ping(&self) -> conveyor_core::Result<()> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn test_task_released_when_store_write_fails() {
    let broker = Arc::new(MemoryBroker::default());
    let store = Arc::new(UnreliableStore {
        inner: MemoryStore::new(),
        failing: AtomicBool::new(false),
        failed_writes: AtomicU32::new(0),
    });
    let registry = Arc::new(TaskRegistry::with_builtins());

    let conveyor = Conveyor::new(broker.clone(), store.clone()).with_registry(registry.clone());
    let task = conveyor
        .submit(SubmitRequest::new("echo", json!("again")), TaskOrigin::Api)
        .await
        .unwrap();
    store.failing.store(true, Ordering::SeqCst);

    let executor = Executor::new("flaky-store", broker.clone(), store.clone(), registry);
    let config = WorkerPoolConfig::new("flaky-store")
        .with_concurrency(1)
        .with_poll_interval(Duration::from_millis(20))
        .with_release_delay(Duration::from_millis(50));
    let mut pool = WorkerPool::new(config, broker.clone(), store.clone(), executor);
    pool.start().await.unwrap();

    for _ in 0..200 {
        if store.failed_writes.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.failed_writes.load(Ordering::SeqCst) > 0);

    // Without the release the delivery would sit in flight until a restart.
    store.failing.store(false, Ordering::SeqCst);
    let done = wait_for_state(&store.inner, &task.id, TaskState::Succeeded).await;
    assert_eq!(done.result, Some(json!("again")));
    assert_eq!(broker.stats().await.unwrap().in_flight, 0);

    pool.shutdown().await.unwrap();
}
