//! paddock-ingest - Multi-source race data ingestion pipeline
//!
//! Fetches from the configured sources under their rate limits, normalizes
//! and reconciles the records into canonical entities, gates them through the
//! outlier detector, and writes one append-only run directory.

use anyhow::Result;
use clap::Parser;
use paddock_common::config::{self, PipelineConfig};
use paddock_ingest::fetch::{ReqwestTransport, Transport};
use paddock_ingest::Pipeline;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "paddock-ingest", version, about = "Race data ingestion pipeline")]
struct Cli {
    /// Path to the pipeline TOML configuration
    #[arg(short, long, env = config::CONFIG_ENV_VAR)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    info!("Starting paddock-ingest");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Step 1: Resolve and load configuration
    let config_path = config::resolve_config_path(cli.config.as_deref())?;
    info!("Configuration: {}", config_path.display());
    let config = PipelineConfig::load(&config_path)?;
    info!(
        "Sources configured: {}",
        config
            .sources
            .iter()
            .map(|s| s.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    // Step 2: Build the pipeline with its external tables
    let pipeline = Pipeline::new(config)?;

    // Step 3: Wire Ctrl-C to graceful cancellation
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing current requests");
            signal_token.cancel();
        }
    });

    // Step 4: Run
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
    let summary = pipeline.run(transport, cancel).await?;

    info!(
        "Run {} complete: {} entity kinds, {} conflicts, {} quarantined{}",
        summary.run_id,
        summary.entities.len(),
        summary.conflicts,
        summary.quarantined,
        if summary.cancelled { " (partial)" } else { "" }
    );

    Ok(())
}
