//! Pool of supervised worker loops sharing one broker.
//!
//! Besides the `concurrency` worker loops the pool runs a heartbeat loop that
//! publishes a [`WorkerHeartbeat`] and a promoter loop that moves due retries
//! back to the ready queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conveyor_core::config::WorkerSettings;
use conveyor_core::topology::RestartPolicy;
use conveyor_core::{Broker, ResultStore, Task, WorkerHeartbeat};

use crate::executor::{Executor, Outcome};
use crate::{Error, Result};

const RESTART_DELAY: Duration = Duration::from_millis(100);
const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub hostname: String,
    pub concurrency: usize,
    /// How long one dequeue waits before checking for shutdown again.
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub promote_interval: Duration,
    pub restart: RestartPolicy,
    pub max_restarts: u32,
    /// How long a delivery whose execution broke off waits before it is
    /// handed out again.
    pub release_delay: Duration,
}

impl WorkerPoolConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        let worker_id = worker_id.into();
        Self {
            hostname: worker_id.clone(),
            worker_id,
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            promote_interval: Duration::from_secs(1),
            restart: RestartPolicy::OnFailure,
            max_restarts: 5,
            release_delay: Duration::from_secs(5),
        }
    }

    pub fn from_settings(worker_id: impl Into<String>, settings: &WorkerSettings) -> Self {
        Self::new(worker_id)
            .with_concurrency(settings.concurrency)
            .with_poll_interval(settings.poll_interval())
            .with_shutdown_timeout(settings.shutdown_timeout())
            .with_heartbeat_interval(settings.heartbeat_interval())
            .with_restart(settings.restart, settings.max_restarts)
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.promote_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy, max_restarts: u32) -> Self {
        self.restart = restart;
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    /// Heartbeats outlive three missed beats before the worker counts as gone.
    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub concurrency: usize,
    pub active: usize,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub restarts: u64,
}

impl PoolStats {
    /// Deliveries that ran to a new state.
    pub fn processed(&self) -> u64 {
        self.succeeded + self.retried + self.failed
    }
}

#[derive(Default)]
struct SharedPoolStats {
    active: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    restarts: AtomicU64,
}

/// Counts a task as active for as long as it is alive, unwinding included.
struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn new(active: &'a AtomicU64) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SharedPoolStats {
    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::Retrying => &self.retried,
            Outcome::Failed => &self.failed,
            Outcome::Duplicate => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, concurrency: usize) -> PoolStats {
        PoolStats {
            concurrency,
            active: self.active.load(Ordering::SeqCst) as usize,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    executor: Arc<Executor>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    started_at: Option<DateTime<Utc>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        executor: Executor,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let executor = executor.with_shutdown(shutdown_tx.subscribe());
        Self {
            config,
            broker,
            store,
            executor: Arc::new(executor),
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            started_at: None,
        }
    }

    /// Reclaims tasks a previous run left in flight, then spawns the loops.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        self.shutdown_tx.send_replace(false);

        match self.broker.recover_in_flight().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Recovered tasks from a previous run"),
            Err(e) => warn!(error = %e, "Failed to recover in-flight tasks"),
        }

        let started_at = Utc::now();
        self.started_at = Some(started_at);

        for slot in 0..self.config.concurrency {
            let worker = Worker {
                name: format!("{}-{}", self.config.worker_id, slot),
                broker: Arc::clone(&self.broker),
                executor: Arc::clone(&self.executor),
                stats: Arc::clone(&self.stats),
                poll_interval: self.config.poll_interval,
                release_delay: self.config.release_delay,
                shutdown: self.shutdown_tx.subscribe(),
            };
            let shutdown = self.shutdown_tx.subscribe();
            let stats = Arc::clone(&self.stats);
            let (restart, budget) = (self.config.restart, self.config.max_restarts);

            self.handles.push(tokio::spawn(supervise(
                worker.name.clone(),
                restart,
                budget,
                shutdown,
                stats,
                move || worker.clone().run(),
            )));
        }

        self.handles.push(tokio::spawn(heartbeat_loop(
            self.config.clone(),
            Arc::clone(&self.store),
            self.broker.queue_name().to_string(),
            Arc::clone(&self.stats),
            started_at,
            self.shutdown_tx.subscribe(),
        )));

        self.handles.push(tokio::spawn(promote_loop(
            Arc::clone(&self.broker),
            self.config.promote_interval,
            self.shutdown_tx.subscribe(),
        )));

        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            queue = %self.broker.queue_name(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Signals every loop to stop and waits for in-progress tasks.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<_> = self.handles.drain(..).collect();
        let wait = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Pool task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, wait).await;
        self.started_at = None;
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(Error::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.concurrency)
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

#[derive(Clone)]
struct Worker {
    name: String,
    broker: Arc<dyn Broker>,
    executor: Arc<Executor>,
    stats: Arc<SharedPoolStats>,
    poll_interval: Duration,
    release_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = %self.name, "Worker loop started");

        while !*self.shutdown.borrow() {
            // Only the wait is cancelled on shutdown, never a running task.
            let next = tokio::select! {
                next = self.broker.dequeue(self.poll_interval) => next,
                _ = self.shutdown.changed() => break,
            };

            match next {
                Ok(Some(task)) => {
                    let delivery = task.clone();
                    let result = {
                        let _active = ActiveGuard::new(&self.stats.active);
                        self.executor.execute(task).await
                    };

                    match result {
                        Ok(outcome) => self.stats.record(&outcome),
                        Err(e) => {
                            error!(worker = %self.name, task_id = %delivery.id, error = %e, "Task execution aborted");
                            self.release(delivery).await;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Failed to dequeue task");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        debug!(worker = %self.name, "Worker loop stopped");
    }

    /// Parks a delivery that broke off mid-execution so it leaves this
    /// consumer's in-flight list and runs again after `release_delay`.
    async fn release(&self, mut delivery: Task) {
        let delay = chrono::Duration::from_std(self.release_delay)
            .unwrap_or_else(|_| chrono::Duration::zero());
        delivery.eta = Some(Utc::now() + delay);

        match self.broker.retry_later(&delivery).await {
            Ok(()) => warn!(worker = %self.name, task_id = %delivery.id, "Released task for redelivery"),
            Err(e) => error!(
                worker = %self.name,
                task_id = %delivery.id,
                error = %e,
                "Failed to release task; it stays in flight until the next restart"
            ),
        }
    }
}

/// Runs the loop produced by `spawn_loop`, restarting it per `restart` until
/// shutdown or until `max_restarts` restarts have been spent.
async fn supervise<F, Fut>(
    name: String,
    restart: RestartPolicy,
    max_restarts: u32,
    shutdown: watch::Receiver<bool>,
    stats: Arc<SharedPoolStats>,
    spawn_loop: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut restarts = 0;

    loop {
        let exit = tokio::spawn(spawn_loop()).await;
        if *shutdown.borrow() {
            break;
        }

        let exited_cleanly = match &exit {
            Ok(()) => true,
            Err(e) => {
                error!(worker = %name, error = %e, "Worker loop crashed");
                false
            }
        };

        if !restart.should_restart(exited_cleanly) {
            warn!(worker = %name, ?restart, "Worker loop not restarted");
            break;
        }
        if restarts >= max_restarts {
            error!(worker = %name, restarts, "Restart budget exhausted");
            break;
        }

        restarts += 1;
        stats.restarts.fetch_add(1, Ordering::SeqCst);
        warn!(worker = %name, restarts, "Restarting worker loop");
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

async fn heartbeat_loop(
    config: WorkerPoolConfig,
    store: Arc<dyn ResultStore>,
    queue: String,
    stats: Arc<SharedPoolStats>,
    started_at: DateTime<Utc>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval.max(MIN_TICK));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let snapshot = stats.to_pool_stats(config.concurrency);
        let heartbeat = WorkerHeartbeat {
            worker_id: config.worker_id.clone(),
            hostname: config.hostname.clone(),
            queue: queue.clone(),
            concurrency: config.concurrency,
            active: snapshot.active,
            processed: snapshot.processed(),
            failed: snapshot.failed,
            started_at,
            last_seen: Utc::now(),
        };

        if let Err(e) = store.heartbeat(&heartbeat, config.heartbeat_ttl()).await {
            warn!(error = %e, "Failed to publish heartbeat");
        }
    }
}

async fn promote_loop(
    broker: Arc<dyn Broker>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(MIN_TICK));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        match broker.promote_due(Utc::now()).await {
            Ok(0) => {}
            Ok(promoted) => debug!(promoted, "Promoted due retries"),
            Err(e) => warn!(error = %e, "Failed to promote delayed tasks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn supervised(
        restart: RestartPolicy,
        budget: u32,
        panics: u32,
    ) -> (Arc<AtomicU32>, Arc<SharedPoolStats>, impl Future<Output = ()>) {
        let runs = Arc::new(AtomicU32::new(0));
        let stats = Arc::new(SharedPoolStats::default());
        let (_tx, rx) = watch::channel(false);

        let counter = Arc::clone(&runs);
        let fut = supervise("w".to_string(), restart, budget, rx, Arc::clone(&stats), move || {
            let counter = Arc::clone(&counter);
            async move {
                let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if run <= panics {
                    panic!("loop {} crashed", run);
                }
            }
        });
        (runs, stats, fut)
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_failure_restarts_crashed_loop() {
        let (runs, stats, fut) = supervised(RestartPolicy::OnFailure, 5, 2);
        fut.await;

        // Two crashes, then a clean exit that on-failure leaves alone.
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(stats.restarts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_policy_never_restarts() {
        let (runs, _, fut) = supervised(RestartPolicy::No, 5, 1);
        fut.await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_budget_is_bounded() {
        let (runs, stats, fut) = supervised(RestartPolicy::Always, 3, u32::MAX);
        fut.await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(stats.restarts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_active_guard_survives_unwind() {
        let stats = SharedPoolStats::default();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _active = ActiveGuard::new(&stats.active);
            assert_eq!(stats.active.load(Ordering::SeqCst), 1);
            panic!("executor blew up");
        }));

        assert!(result.is_err());
        assert_eq!(stats.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = WorkerSettings {
            concurrency: 0,
            poll_interval_secs: 2,
            task_timeout_secs: 60,
            shutdown_timeout_secs: 5,
            heartbeat_interval_secs: 4,
            restart: RestartPolicy::Always,
            max_restarts: 9,
        };
        let config = WorkerPoolConfig::from_settings("host-a", &settings);

        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat_ttl(), Duration::from_secs(12));
        assert_eq!(config.restart, RestartPolicy::Always);
        assert_eq!(config.max_restarts, 9);
    }
}
