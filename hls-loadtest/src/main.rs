//! hls-loadtest - concurrent HLS client load generator.
//!
//! Drives N concurrent ffmpeg-compatible HLS fetchers against a stream URL,
//! supervising restarts, aggregating throughput/health metrics, and exposing
//! them over a Prometheus endpoint and a terminal dashboard.

mod cli;
mod config;
mod dashboard;
mod errors;
mod logging;
mod metrics_server;
mod orchestrator;
mod preflight;
mod summary;

use clap::Parser;
use tracing::error;

use crate::cli::Cli;
use crate::config::Config;
use crate::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    logging::init(&config);

    let orchestrator = Orchestrator::new(config);
    if let Err(err) = orchestrator.run().await {
        error!(error = %err, "run failed");
        return Err(err.into());
    }

    Ok(())
}
