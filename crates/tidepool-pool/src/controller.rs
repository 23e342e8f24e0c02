//! Elastic pool controller.
//!
//! Acquires a worker pool for one job and guarantees it is torn down.
//! A pool moves `Uninitialized → Scaling → Active → Closed`; `Closed` is
//! final. Teardown runs through [`PoolController::release`] on normal exit
//! paths and through `Drop` when a handle is abandoned (a panicking or
//! aborted job task), so no exit path leaks a cluster.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::provisioner::{ClusterProvisioner, ProvisionedCluster};
use crate::sizing::{SizingPlan, WorkerBounds};

/// Lifecycle state of a job's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Scaling,
    Active,
    Closed,
}

impl PoolState {
    pub fn can_transition_to(self, next: PoolState) -> bool {
        use PoolState::*;
        matches!(
            (self, next),
            (Uninitialized, Scaling) | (Scaling, Active) | (Uninitialized | Scaling | Active, Closed)
        )
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Scaling => "scaling",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A provisioned pool owned by exactly one job.
pub struct PoolHandle {
    job_id: String,
    bounds: WorkerBounds,
    state: PoolState,
    cluster: Option<Box<dyn ProvisionedCluster>>,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("job_id", &self.job_id)
            .field("bounds", &self.bounds)
            .field("state", &self.state)
            .field("cluster", &self.cluster_name())
            .finish()
    }
}

impl PoolHandle {
    fn new(job_id: &str, bounds: WorkerBounds) -> Self {
        Self {
            job_id: job_id.to_string(),
            bounds,
            state: PoolState::Uninitialized,
            cluster: None,
        }
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn bounds(&self) -> WorkerBounds {
        self.bounds
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster.as_deref().map(|c| c.name())
    }

    /// Workers available for fan-out, never less than one.
    pub fn workers(&self) -> usize {
        self.cluster
            .as_deref()
            .map(|c| c.ready_workers())
            .unwrap_or(0)
            .max(1) as usize
    }

    fn advance(&mut self, next: PoolState) {
        if self.state.can_transition_to(next) {
            debug!(job_id = %self.job_id, from = %self.state, to = %next, "pool state");
            self.state = next;
        } else {
            warn!(job_id = %self.job_id, from = %self.state, to = %next, "ignoring invalid pool transition");
        }
    }

    /// Close the cluster. Later calls are no-ops.
    async fn shutdown(&mut self) -> anyhow::Result<()> {
        if self.state == PoolState::Closed {
            return Ok(());
        }
        self.advance(PoolState::Closed);
        match self.cluster.take() {
            Some(cluster) => cluster.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        let Some(cluster) = self.cluster.take() else {
            return;
        };
        warn!(job_id = %self.job_id, cluster = %cluster.name(), "pool handle dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let job_id = std::mem::take(&mut self.job_id);
                runtime.spawn(async move {
                    if let Err(e) = cluster.close().await {
                        warn!(%job_id, error = %e, "pool teardown after drop failed");
                    }
                });
            }
            Err(_) => warn!(job_id = %self.job_id, "no runtime to close abandoned pool"),
        }
    }
}

/// Hands out and reclaims per-job pools.
#[derive(Clone)]
pub struct PoolController {
    provisioner: Arc<dyn ClusterProvisioner>,
    ready_timeout: Duration,
}

impl PoolController {
    pub fn new(provisioner: Arc<dyn ClusterProvisioner>, ready_timeout: Duration) -> Self {
        Self {
            provisioner,
            ready_timeout,
        }
    }

    /// Provision a pool for `plan` and wait for its minimum workers.
    ///
    /// Any failure is final for the job. A cluster that was created before
    /// the failure is closed before the error is returned.
    pub async fn acquire(&self, job_id: &str, plan: &SizingPlan) -> PoolResult<PoolHandle> {
        let mut handle = PoolHandle::new(job_id, plan.bounds());
        match self.bring_up(&mut handle, plan).await {
            Ok(()) => {
                handle.advance(PoolState::Active);
                info!(
                    job_id,
                    cluster = ?handle.cluster_name(),
                    min = plan.min_workers,
                    max = plan.max_workers,
                    workers = handle.workers(),
                    "pool active"
                );
                Ok(handle)
            }
            Err(e) => {
                warn!(job_id, error = %e, "pool acquisition failed");
                if let Err(close_err) = handle.shutdown().await {
                    warn!(job_id, error = %close_err, "closing partial pool failed");
                }
                Err(e)
            }
        }
    }

    async fn bring_up(&self, handle: &mut PoolHandle, plan: &SizingPlan) -> PoolResult<()> {
        let spec = plan.worker_spec(&handle.job_id);
        let cluster = self
            .provisioner
            .provision(&spec, plan.min_workers)
            .await
            .map_err(|e| PoolError::Provision(e.to_string()))?;
        let name = cluster.name().to_string();
        handle.cluster = Some(cluster);
        handle.advance(PoolState::Scaling);

        let Some(cluster) = handle.cluster.as_deref() else {
            return Err(PoolError::Provision("cluster vanished".to_string()));
        };
        cluster
            .adapt(plan.min_workers, plan.max_workers)
            .await
            .map_err(|e| PoolError::Scale {
                cluster: name.clone(),
                reason: e.to_string(),
            })?;
        cluster
            .wait_ready(plan.min_workers, self.ready_timeout)
            .await
            .map_err(|e| PoolError::NotReady {
                cluster: name,
                workers: plan.min_workers,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Tear the pool down. Errors are logged, never returned.
    pub async fn release(&self, mut handle: PoolHandle) {
        let job_id = handle.job_id.clone();
        let cluster = handle.cluster_name().map(str::to_string);
        match handle.shutdown().await {
            Ok(()) => info!(%job_id, ?cluster, "pool released"),
            Err(e) => warn!(%job_id, ?cluster, error = %e, "pool teardown failed"),
        }
    }
}
