//! Daemon assembly.
//!
//! Wires the configured subsystems together: state store (redb), dataset
//! catalog, pool controller, job manager and the purge loop. `main.rs`
//! only parses flags, installs logging and serves the router.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tidepool_core::TidepoolConfig;
use tidepool_jobs::{DatasetResolver, DirectoryCatalog, JobContext, JobManager, MemoryCatalog};
use tidepool_pool::{InProcessProvisioner, PoolController};
use tidepool_state::StateStore;
use tokio::sync::watch;
use tracing::{info, warn};

/// File name of the state database inside the data directory.
pub const STATE_FILE: &str = "tidepool.redb";

/// Open (or create) the on-disk state store under `storage.data_dir`.
pub fn open_store(config: &TidepoolConfig) -> anyhow::Result<StateStore> {
    let data_dir = &config.storage.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let path: PathBuf = data_dir.join(STATE_FILE);
    let store = StateStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
    info!(path = %path.display(), "state store opened");
    Ok(store)
}

/// Dataset resolver for the configured catalog.
pub fn build_resolver(config: &TidepoolConfig) -> Arc<dyn DatasetResolver> {
    match &config.catalog.dir {
        Some(dir) => {
            info!(dir = %dir.display(), "serving datasets from catalog directory");
            Arc::new(DirectoryCatalog::new(dir.clone()))
        }
        None => {
            warn!("no catalog directory configured, every dataset will resolve as not found");
            Arc::new(MemoryCatalog::new())
        }
    }
}

/// Build the job manager and fail any jobs a previous process left behind.
pub fn build_jobs(config: &TidepoolConfig, store: StateStore) -> anyhow::Result<JobManager> {
    let provisioner = InProcessProvisioner::default();
    let pools = PoolController::new(
        Arc::new(provisioner),
        Duration::from_secs(config.sizing.pool_ready_timeout_secs),
    );
    let ctx = JobContext::from_config(config, store, build_resolver(config), pools)?;
    let jobs = JobManager::new(ctx, &config.jobs);

    let recovered = jobs.recover()?;
    if recovered > 0 {
        warn!(recovered, "failed jobs interrupted by the previous shutdown");
    }
    info!(
        max_concurrent_jobs = config.jobs.max_concurrent_jobs,
        data_threshold_gb = config.sizing.data_threshold_gb,
        "job manager initialized"
    );
    Ok(jobs)
}

/// Purge expired jobs and dedup entries every `interval` until shutdown.
pub async fn run_purge_loop(jobs: JobManager, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "purge loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = jobs.purge() {
                    warn!(error = %e, "purge failed");
                }
            }
            _ = shutdown.changed() => {
                info!("purge loop shutting down");
                break;
            }
        }
    }
}
