pub mod error;
pub mod executor;
pub mod pool;

use std::future::Future;
use std::sync::Arc;

use conveyor_broker::Backends;
use conveyor_core::config::{instance_name, Settings};
use conveyor_core::TaskRegistry;
use conveyor_db::Database;

// Re-exports
pub use error::{Error, Result};
pub use executor::{Executor, Outcome};
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig};

/// Runs a worker pool for `registry` until `shutdown` resolves.
///
/// Startup is gated on the broker, the result store and, when configured, the
/// database answering within the startup retry budget.
pub async fn run(
    settings: &Settings,
    registry: TaskRegistry,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let worker_id = instance_name("worker");
    let backends = Backends::open_when_ready(settings, &worker_id).await?;
    let db = Database::open_when_ready(settings).await?.map(Arc::new);
    run_pool(settings, worker_id, backends, db, registry, shutdown).await
}

/// Runs a pool over already-open backends.
pub async fn run_pool(
    settings: &Settings,
    worker_id: String,
    backends: Backends,
    db: Option<Arc<Database>>,
    registry: TaskRegistry,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut executor = Executor::new(
        worker_id.clone(),
        Arc::clone(&backends.broker),
        Arc::clone(&backends.store),
        Arc::new(registry),
    )
    .with_retry_policy(settings.retry)
    .with_task_timeout(settings.worker.task_timeout());
    if let Some(db) = db {
        executor = executor.with_database(db);
    }

    let config = WorkerPoolConfig::from_settings(worker_id, &settings.worker);
    let mut pool = WorkerPool::new(config, backends.broker, backends.store, executor);
    pool.start().await?;

    shutdown.await;

    let stats = pool.stats();
    pool.shutdown().await?;
    tracing::info!(
        succeeded = stats.succeeded,
        retried = stats.retried,
        failed = stats.failed,
        restarts = stats.restarts,
        "Worker stopped"
    );
    Ok(())
}
