use anyhow::Result;

use conveyor_core::config::Settings;
use conveyor_core::signal::shutdown_signal;
use conveyor_core::telemetry::init_tracing;
use conveyor_core::TaskRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    init_tracing("conveyor_worker=info,conveyor_core=info", settings.log.format);

    tracing::info!("Starting Conveyor worker");

    conveyor_worker::run(&settings, TaskRegistry::with_builtins(), shutdown_signal()).await
}
