use anyhow::Result;
use clap::Parser;

mod cli;
mod client;
mod commands;

use cli::{Cli, Commands};
use client::ApiClient;
use conveyor_core::config::Settings;
use conveyor_core::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };

    // Long-running services log at info; client commands stay quiet.
    let default_filter = match cli.command {
        Commands::Serve { .. } | Commands::Worker { .. } | Commands::Beat { .. } => {
            "conveyor_cli=info,conveyor_core=info,conveyor_api=info,conveyor_worker=info,conveyor_beat=info,tower_http=info"
        }
        _ => "warn",
    };
    init_tracing(default_filter, settings.log.format);

    let api = ApiClient::new(cli.api_url.clone().unwrap_or_else(|| settings.api.base_url()));

    commands::execute(cli.command, settings, api).await
}
