use anyhow::Result;

use conveyor_core::config::Settings;
use conveyor_core::signal::shutdown_signal;
use conveyor_core::telemetry::init_tracing;
use conveyor_core::TaskRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    init_tracing(
        "conveyor_api=debug,tower_http=debug,axum::rejection=trace",
        settings.log.format,
    );

    let state = conveyor_api::build_state(&settings, TaskRegistry::with_builtins()).await?;
    conveyor_api::serve(&settings, state, shutdown_signal()).await
}
