//! Cluster provisioner seam.
//!
//! A provisioner turns a [`WorkerSpec`] into a running worker group that
//! can be rescaled between bounds and closed. Production deployments plug
//! in an orchestrator-backed implementation; [`InProcessProvisioner`]
//! serves standalone mode and tests, where "workers" are concurrency slots
//! in the daemon's own runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::sizing::WorkerSpec;

/// Creates worker clusters from a worker template.
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Start a cluster with `initial_workers` workers.
    async fn provision(
        &self,
        spec: &WorkerSpec,
        initial_workers: u32,
    ) -> anyhow::Result<Box<dyn ProvisionedCluster>>;
}

/// A provisioned worker group.
#[async_trait]
pub trait ProvisionedCluster: Send + Sync {
    fn name(&self) -> &str;

    /// Let the cluster scale itself between `min` and `max` workers.
    async fn adapt(&self, min: u32, max: u32) -> anyhow::Result<()>;

    /// Resolve once at least `workers` are ready, or fail after `timeout`.
    async fn wait_ready(&self, workers: u32, timeout: Duration) -> anyhow::Result<()>;

    /// Workers currently ready to take work.
    fn ready_workers(&self) -> u32;

    /// Tear the cluster down. Calling it twice is harmless.
    async fn close(&self) -> anyhow::Result<()>;
}

// ── In-process ─────────────────────────────────────────────────────

/// Provisioner whose clusters live inside the current process.
///
/// Workers become ready as soon as the cluster is adapted; the ready count
/// is capped by `max_local_workers` so a huge plan cannot oversubscribe the
/// host.
#[derive(Debug, Clone)]
pub struct InProcessProvisioner {
    max_local_workers: u32,
    next_id: Arc<AtomicU64>,
}

impl InProcessProvisioner {
    pub fn new(max_local_workers: u32) -> Self {
        Self {
            max_local_workers: max_local_workers.max(1),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl Default for InProcessProvisioner {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);
        Self::new(cores)
    }
}

#[async_trait]
impl ClusterProvisioner for InProcessProvisioner {
    async fn provision(
        &self,
        spec: &WorkerSpec,
        initial_workers: u32,
    ) -> anyhow::Result<Box<dyn ProvisionedCluster>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("local-{id}");
        let ready = initial_workers.min(self.max_local_workers);
        let (ready_tx, _) = watch::channel(ready);
        info!(
            cluster = %name,
            image = %spec.image,
            initial_workers,
            ready,
            "in-process cluster provisioned"
        );
        Ok(Box::new(InProcessCluster {
            name,
            cap: self.max_local_workers,
            ready: ready_tx,
        }))
    }
}

struct InProcessCluster {
    name: String,
    cap: u32,
    ready: watch::Sender<u32>,
}

#[async_trait]
impl ProvisionedCluster for InProcessCluster {
    fn name(&self) -> &str {
        &self.name
    }

    async fn adapt(&self, min: u32, max: u32) -> anyhow::Result<()> {
        anyhow::ensure!(min <= max, "adapt bounds inverted: min {min} > max {max}");
        let target = max.min(self.cap);
        self.ready.send_replace(target);
        debug!(cluster = %self.name, min, max, ready = target, "cluster adapted");
        Ok(())
    }

    async fn wait_ready(&self, workers: u32, timeout: Duration) -> anyhow::Result<()> {
        let wanted = workers.min(self.cap);
        let mut rx = self.ready.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|ready| *ready >= wanted))
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {timeout:?}"))?
            .map_err(|e| anyhow::anyhow!("cluster {} went away: {e}", self.name))?;
        Ok(())
    }

    fn ready_workers(&self) -> u32 {
        *self.ready.borrow()
    }

    async fn close(&self) -> anyhow::Result<()> {
        let previous = self.ready.send_replace(0);
        if previous > 0 {
            info!(cluster = %self.name, "in-process cluster closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizing::{SizingPlan, plan};
    use tidepool_core::{ImageRef, SizingConfig};

    fn spec() -> WorkerSpec {
        let plan: SizingPlan = plan(
            100 * 1024 * 1024 * 1024,
            &SizingConfig::default(),
            &ImageRef::parse("tidepool/worker:test").unwrap(),
        );
        plan.worker_spec("job-1")
    }

    #[tokio::test]
    async fn adapt_makes_workers_ready() {
        let provisioner = InProcessProvisioner::new(8);
        let cluster = provisioner.provision(&spec(), 1).await.unwrap();
        assert_eq!(cluster.ready_workers(), 1);

        cluster.adapt(1, 7).await.unwrap();
        cluster.wait_ready(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(cluster.ready_workers(), 7);
    }

    #[tokio::test]
    async fn ready_count_is_capped_locally() {
        let provisioner = InProcessProvisioner::new(2);
        let cluster = provisioner.provision(&spec(), 5).await.unwrap();
        cluster.adapt(5, 50).await.unwrap();
        assert_eq!(cluster.ready_workers(), 2);
        // Waiting for more than the cap waits for the cap.
        cluster.wait_ready(5, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_ready_times_out_after_close() {
        let provisioner = InProcessProvisioner::new(4);
        let cluster = provisioner.provision(&spec(), 1).await.unwrap();
        cluster.close().await.unwrap();
        cluster.close().await.unwrap();
        let err = cluster
            .wait_ready(1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn inverted_bounds_rejected() {
        let cluster = InProcessProvisioner::new(4)
            .provision(&spec(), 1)
            .await
            .unwrap();
        assert!(cluster.adapt(3, 1).await.is_err());
    }
}
