pub mod handlers;
pub mod routes;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use conveyor_beat::{configured_entries, Beat};
use conveyor_broker::Backends;
use conveyor_core::config::{instance_name, Settings};
use conveyor_core::{Conveyor, TaskRegistry};
use conveyor_db::Database;

pub use routes::create_router;
pub use state::ApiState;

/// Connects to the backing services and builds the shared state.
pub async fn build_state(settings: &Settings, registry: TaskRegistry) -> anyhow::Result<ApiState> {
    let backends = Backends::open_when_ready(settings, &instance_name("api")).await?;
    let db = Database::open_when_ready(settings).await?.map(Arc::new);
    state_from(settings, backends, db, registry).await
}

/// Builds the state over already-open backends, creating the history schema
/// when a database is attached.
pub async fn state_from(
    settings: &Settings,
    backends: Backends,
    db: Option<Arc<Database>>,
    registry: TaskRegistry,
) -> anyhow::Result<ApiState> {
    match &db {
        Some(db) => db.init_schema().await?,
        None => tracing::warn!("No database configured, running without persistence"),
    }

    let mut conveyor = Conveyor::new(backends.broker, backends.store)
        .with_registry(Arc::new(registry))
        .with_default_max_retries(settings.retry.max_retries);
    if let Some(db) = &db {
        conveyor = conveyor.with_submit_hook(db.clone());
    }
    let beat = Beat::new(configured_entries(settings)?, conveyor.clone())?;

    Ok(ApiState {
        conveyor,
        db,
        beat: Arc::new(beat),
    })
}

/// Serves the HTTP API until `shutdown` resolves.
pub async fn serve(
    settings: &Settings,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = settings.api.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Conveyor API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
