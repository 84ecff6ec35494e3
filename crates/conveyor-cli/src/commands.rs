use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use conveyor_broker::{Backends, RedisBroker, RedisStore};
use conveyor_core::config::{hostname, instance_name, BrokerBackend, Settings};
use conveyor_core::signal::shutdown_signal;
use conveyor_core::topology::Topology;
use conveyor_core::{ResultStore, SubmitRequest, TaskRegistry, TaskState, WorkerHeartbeat};
use conveyor_db::Database;

use crate::cli::{Commands, ProbeTarget};
use crate::client::ApiClient;

pub async fn execute(command: Commands, mut settings: Settings, api: ApiClient) -> Result<()> {
    match command {
        Commands::Serve {
            port,
            with_worker,
            with_beat,
        } => {
            if let Some(port) = port {
                settings.api.port = port;
            }
            serve(settings, with_worker, with_beat).await?;
        }

        Commands::Worker { concurrency } => {
            if let Some(concurrency) = concurrency {
                settings.worker.concurrency = concurrency;
            }
            println!("Starting worker ({} slots)...", settings.worker.concurrency);
            conveyor_worker::run(&settings, TaskRegistry::with_builtins(), shutdown_signal())
                .await?;
        }

        Commands::Beat { schedules } => {
            if let Some(path) = schedules {
                settings.beat.schedule_file = Some(path.display().to_string());
            }
            println!("Starting beat...");
            conveyor_beat::run(&settings, shutdown_signal()).await?;
        }

        Commands::Submit {
            name,
            payload,
            queue,
            max_retries,
            wait,
            timeout,
        } => {
            let payload = serde_json::from_str(&payload).context("--payload must be JSON")?;
            let request = SubmitRequest {
                name,
                payload,
                queue,
                max_retries,
            };

            let task = api.submit(&request).await?;
            println!("✓ Task queued: {}", task.id);
            println!("  Name: {}", task.name);
            println!("  Queue: {}", task.queue);

            if wait {
                println!("\nWaiting for result...");
                let done = wait_for_task(&api, &task.id, Duration::from_secs(timeout)).await?;
                print_task(&done);
                if done.state == TaskState::Failed {
                    bail!("task {} failed", done.id);
                }
            }
        }

        Commands::Status { task_id, logs } => {
            let task = api
                .task(&task_id)
                .await?
                .ok_or_else(|| anyhow!("Task not found: {}", task_id))?;
            print_task(&task);

            if logs {
                let entries = api.logs(&task_id).await?;
                if !entries.is_empty() {
                    println!("\n  Execution Logs:");
                    for log in entries {
                        println!("    [{}] {}: {}", log.timestamp, log.event_type, log.message);
                    }
                }
            }
        }

        Commands::List { state, limit } => {
            let state: Option<TaskState> = state.map(|s| s.parse()).transpose()?;
            let tasks = api.recent(limit, state).await?;

            println!("Recent Tasks: {}", tasks.len());
            println!();
            for task in tasks {
                println!("{}  {:<10} {:<20} {}", task.id, task.state, task.name, task.created_at);
            }
        }

        Commands::Stats => {
            let stats = api.stats().await?;
            let engine = &stats.engine_stats;

            println!("Conveyor Statistics\n");
            println!("Queue '{}':", engine.queue.queue);
            println!("  Pending: {}", engine.queue.pending);
            println!("  In flight: {}", engine.queue.in_flight);
            println!("  Delayed: {}", engine.queue.delayed);
            println!("  Dead: {}", engine.queue.dead);
            println!("\nWorkers:");
            println!("  Live: {}", engine.live_workers);
            println!("  Slots: {} ({} busy)", engine.worker_slots, engine.active_tasks);
            println!("  Processed: {}", engine.processed);
            println!("  Failed: {}", engine.failed);

            if let Some(db) = stats.db_stats {
                println!("\nDatabase Stats:");
                println!("  Total tasks: {}", db.total_tasks);
                println!("  Succeeded: {}", db.succeeded_tasks);
                println!("  Failed: {}", db.failed_tasks);
                println!("  Retrying: {}", db.retrying_tasks);
                if let Some(avg) = db.avg_runtime_ms {
                    println!("  Avg runtime: {:.2}s", avg / 1000.0);
                }
            }
        }

        Commands::Dead { limit } => {
            let letters = api.dead_letters(limit).await?;

            println!("Dead Letters: {}", letters.len());
            println!();
            for letter in letters {
                println!(
                    "{}  {:<20} {}  {}",
                    letter.task.id, letter.task.name, letter.moved_at, letter.reason
                );
            }
        }

        Commands::InitDb => {
            let db = open_database(&settings).await?;
            println!("Initializing database schema...");
            db.init_schema().await?;
            println!("✓ Database initialized successfully");
        }

        Commands::Purge { older_than_days } => {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
            let db = open_database(&settings).await?;
            let purged = db.purge_finished_before(cutoff).await?;
            println!("✓ Purged {} tasks finished before {}", purged, cutoff);
        }

        Commands::Probe { target } => {
            let timeout = Duration::from_secs(settings.startup.timeout_secs);
            tokio::time::timeout(timeout, probe(target, &settings, &api))
                .await
                .map_err(|_| anyhow!("{:?} probe timed out after {:?}", target, timeout))??;
            println!("✓ {:?} healthy", target);
        }

        Commands::Topology { file } => {
            let topology = match file {
                Some(path) => Topology::load(&path)?,
                None => Topology::reference(),
            };
            topology.validate()?;

            println!("✓ {} services, startup order:", topology.services.len());
            for (i, wave) in topology.startup_waves()?.iter().enumerate() {
                println!("  Wave {}:", i + 1);
                for name in wave {
                    let gates = topology.health_gates(name);
                    if gates.is_empty() {
                        println!("    {}", name);
                    } else {
                        println!("    {} (waits for healthy {})", name, gates.join(", "));
                    }
                }
            }
        }
    }

    Ok(())
}

async fn open_database(settings: &Settings) -> Result<Database> {
    let url = settings
        .database_url()
        .ok_or_else(|| anyhow!("No database configured (set DATABASE_URL or POSTGRES_USER)"))?;
    Ok(Database::new(&url).await?)
}

/// API plus optional in-process worker and beat, sharing one set of backends.
async fn serve(settings: Settings, with_worker: bool, with_beat: bool) -> Result<()> {
    let name = instance_name("api");
    let backends = Backends::open_when_ready(&settings, &name).await?;
    let db = Database::open_when_ready(&settings).await?.map(Arc::new);

    let state =
        conveyor_api::state_from(&settings, backends.clone(), db.clone(), TaskRegistry::with_builtins())
            .await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let on_shutdown = |tx: &broadcast::Sender<()>| {
        let mut rx = tx.subscribe();
        async move {
            let _ = rx.recv().await;
        }
    };

    let mut services = Vec::new();

    if with_worker {
        let settings = settings.clone();
        let (backends, db) = (backends.clone(), db.clone());
        let shutdown = on_shutdown(&shutdown_tx);
        services.push(tokio::spawn(async move {
            conveyor_worker::run_pool(
                &settings,
                name,
                backends,
                db,
                TaskRegistry::with_builtins(),
                shutdown,
            )
            .await
        }));
    }

    if with_beat {
        let beat = Arc::clone(&state.beat);
        let tick = Duration::from_secs(settings.beat.tick_secs);
        let shutdown = on_shutdown(&shutdown_tx);
        services.push(tokio::spawn(async move {
            beat.run(tick, shutdown).await;
            Ok(())
        }));
    }

    let tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(());
    });

    println!("Starting API server on {}...", settings.api.bind_addr());
    conveyor_api::serve(&settings, state, on_shutdown(&shutdown_tx)).await?;

    for service in services {
        service.await??;
    }
    Ok(())
}

async fn probe(target: ProbeTarget, settings: &Settings, api: &ApiClient) -> Result<()> {
    match target {
        ProbeTarget::Api => {
            api.health().await?;
        }
        ProbeTarget::Redis => {
            let store = RedisStore::connect(&settings.redis.url(), settings.results.ttl()).await?;
            store.ping().await?;
        }
        ProbeTarget::Broker => {
            if settings.broker.backend == BrokerBackend::Memory {
                return Ok(());
            }
            let broker =
                RedisBroker::connect(&settings.broker_url(), &settings.broker.queue, "probe").await?;
            conveyor_core::Broker::ping(&broker).await?;
        }
        ProbeTarget::Postgres => {
            open_database(settings).await?.ping().await?;
        }
        ProbeTarget::Worker => {
            let store = RedisStore::connect(&settings.redis.url(), settings.results.ttl()).await?;
            let workers = store.workers().await?;
            let me = hostname();
            if !worker_is_live(&workers, me.as_deref()) {
                bail!(
                    "no heartbeat from {}",
                    me.as_deref().unwrap_or("any worker")
                );
            }
        }
    }
    Ok(())
}

/// Inside a container the heartbeat must be this host's own; elsewhere any
/// live worker will do.
fn worker_is_live(workers: &[WorkerHeartbeat], me: Option<&str>) -> bool {
    match me {
        Some(me) => workers.iter().any(|w| w.worker_id == me || w.hostname == me),
        None => !workers.is_empty(),
    }
}

async fn wait_for_task(
    api: &ApiClient,
    task_id: &str,
    timeout: Duration,
) -> Result<conveyor_api::handlers::task::TaskResponse> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(task) = api.task(task_id).await? {
            if task.state.is_terminal() {
                return Ok(task);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("task {} did not finish within {:?}", task_id, timeout);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn print_task(task: &conveyor_api::handlers::task::TaskResponse) {
    println!("Task: {}", task.id);
    println!("  Name: {}", task.name);
    println!("  State: {}", task.state);
    println!("  Attempts: {} (max retries {})", task.attempts, task.max_retries);
    println!("  Origin: {}", task.origin);
    println!("  Created: {}", task.created_at);

    if let Some(started) = task.started_at {
        println!("  Started: {}", started);
    }
    if let Some(completed) = task.completed_at {
        println!("  Completed: {}", completed);
    }
    if let Some(runtime) = task.runtime_ms {
        println!("  Duration: {} ms", runtime);
    }
    if let Some(eta) = task.eta {
        println!("  Next attempt: {}", eta);
    }
    if let Some(result) = &task.result {
        println!("  Result: {}", result);
    }
    if let Some(error) = &task.error {
        println!("  Error: {}", error);
    }
}
