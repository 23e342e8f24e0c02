//! tidepool-pool — compute sizing and elastic worker pools.
//!
//! - **`sizing`** — pure estimator from requested bytes to a [`Placement`]
//! - **`provisioner`** — the cluster provisioner seam and an in-process
//!   implementation for standalone deployments
//! - **`controller`** — acquires, scales and tears down a job's pool

pub mod controller;
pub mod error;
pub mod provisioner;
pub mod sizing;

pub use controller::{PoolController, PoolHandle, PoolState};
pub use error::{PoolError, PoolResult};
pub use provisioner::{ClusterProvisioner, InProcessProvisioner, ProvisionedCluster};
pub use sizing::{Placement, SHARED_BOUNDS, SizingPlan, WorkerBounds, WorkerSpec, estimate};
