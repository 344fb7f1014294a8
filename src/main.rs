//! Conductor server
//!
//! Run with: cargo run --bin conductor -- --config config.toml
//!
//! Without `--config` the configuration is read from the default locations
//! (`~/.config/conductor/config.toml`, `/etc/conductor/config.toml`,
//! `./config.toml`). `CONDUCTOR_*` environment variables override file values
//! and `RUST_LOG` overrides the configured log level.

use anyhow::Context;
use clap::Parser;
use conductor::config::Config;
use conductor::logging::init_tracing;
use conductor::{serve, AppState, QueryOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Query orchestration server")]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run the pre-aggregation refresh once and exit
    #[arg(long)]
    refresh_once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::load_default(),
    };
    init_tracing(&config.logging);

    tracing::info!("Starting Conductor v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        store = ?config.store.backend,
        data_sources = config.data_sources.len(),
        pre_aggregations = config.pre_aggregations.definitions.len(),
        "Configuration loaded"
    );

    let orchestrator = Arc::new(
        QueryOrchestrator::from_config(&config)
            .await
            .context("Failed to initialize orchestrator")?,
    );

    if args.refresh_once {
        for report in orchestrator.scheduler().refresh_all().await {
            match report {
                Ok(report) => tracing::info!(
                    pre_aggregation = %report.pre_aggregation,
                    refreshed = report.refreshed.len(),
                    failed = report.failed.len(),
                    "Refreshed"
                ),
                Err(e) => tracing::error!(error = %e, "Refresh failed"),
            }
        }
        orchestrator.shutdown().await;
        return Ok(());
    }

    let workers = orchestrator.start_background();

    if config.api.enabled {
        let state = AppState::new(Arc::clone(&orchestrator), config.api.clone());
        serve(state).await.context("API server failed")?;
    } else {
        tracing::info!("Admin API disabled, running background workers only");
        conductor::api::shutdown_signal().await;
    }

    tracing::info!("Shutting down...");
    orchestrator.shutdown().await;
    for worker in workers {
        worker.abort();
    }

    tracing::info!("Conductor shutdown complete");
    Ok(())
}
