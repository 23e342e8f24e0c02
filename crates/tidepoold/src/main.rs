//! tidepoold — the Tidepool daemon.
//!
//! Single binary that assembles the Tidepool subsystems:
//! - State store (redb)
//! - Dataset catalog
//! - Pool controller (in-process provisioner)
//! - Job manager + purge loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! tidepoold --config /etc/tidepool/tidepool.toml --port 8080 --log-format json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tidepool_core::TidepoolConfig;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tidepoold=debug,tidepool=debug";

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "tidepoold", about = "Tidepool fetch-and-merge daemon")]
struct Cli {
    /// Path to tidepool.toml. Defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides `server.port`).
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for persistent state (overrides `storage.data_dir`).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory of `<id>.json` datasets (overrides `catalog.dir`).
    #[arg(long)]
    catalog_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = TidepoolConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(catalog_dir) = cli.catalog_dir {
        config.catalog.dir = Some(catalog_dir);
    }

    run(config).await
}

async fn run(config: TidepoolConfig) -> anyhow::Result<()> {
    info!("Tidepool daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let store = tidepoold::open_store(&config)?;
    let jobs = tidepoold::build_jobs(&config, store)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let purge_handle = tokio::spawn(tidepoold::run_purge_loop(
        jobs.clone(),
        Duration::from_secs(config.jobs.purge_interval_secs),
        shutdown_rx,
    ));

    // ── Start API server ───────────────────────────────────────

    let router = tidepool_api::build_router(jobs);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = purge_handle.await;

    info!("Tidepool daemon stopped");
    Ok(())
}
