use anyhow::Result;

use conveyor_core::config::Settings;
use conveyor_core::signal::shutdown_signal;
use conveyor_core::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    init_tracing("conveyor_beat=info,conveyor_core=info", settings.log.format);

    tracing::info!("Starting Conveyor beat");

    conveyor_beat::run(&settings, shutdown_signal()).await
}
