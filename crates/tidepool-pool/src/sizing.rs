//! Resource sizing — requested bytes to worker-pool bounds.
//!
//! Sizing depends only on the total estimated size of the projected
//! variables across every requested dataset. Jobs at or below the
//! configured threshold run on the shared path; larger ones get an
//! elastic pool sized so that each worker holds at most one memory limit
//! worth of data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tidepool_core::size::bytes_to_gib;
use tidepool_core::{ImageRef, SizingConfig};

/// Worker-count bounds reported for jobs that stay on the shared path.
pub const SHARED_BOUNDS: WorkerBounds = WorkerBounds { min: 1, max: 2 };

/// Labels every pool worker carries.
const COMPONENT_LABEL: (&str, &str) = ("app.kubernetes.io/component", "tidepool-worker");
const JOB_LABEL: &str = "tidepool.io/job";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBounds {
    pub min: u32,
    pub max: u32,
}

/// Bounds and per-worker resources for an elastic pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingPlan {
    pub total_bytes: u64,
    pub min_workers: u32,
    pub max_workers: u32,
    pub memory_limit_gb: f64,
    pub memory_request_gb: f64,
    pub cpu_limit: f64,
    pub cpu_request: f64,
    pub image: ImageRef,
    pub threads_per_worker: u32,
    pub node_selector: BTreeMap<String, String>,
}

impl SizingPlan {
    pub fn bounds(&self) -> WorkerBounds {
        WorkerBounds {
            min: self.min_workers,
            max: self.max_workers,
        }
    }

    /// Worker template handed to the cluster provisioner.
    pub fn worker_spec(&self, job_id: &str) -> WorkerSpec {
        let labels = BTreeMap::from([
            (COMPONENT_LABEL.0.to_string(), COMPONENT_LABEL.1.to_string()),
            (JOB_LABEL.to_string(), job_id.to_string()),
        ]);
        WorkerSpec {
            image: self.image.clone(),
            memory_limit_gb: self.memory_limit_gb,
            memory_request_gb: self.memory_request_gb,
            cpu_limit: self.cpu_limit,
            cpu_request: self.cpu_request,
            threads_per_worker: self.threads_per_worker,
            labels,
            node_selector: self.node_selector.clone(),
            restart_policy: "Never".to_string(),
        }
    }
}

/// Container template for one pool worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub image: ImageRef,
    pub memory_limit_gb: f64,
    pub memory_request_gb: f64,
    pub cpu_limit: f64,
    pub cpu_request: f64,
    pub threads_per_worker: u32,
    pub labels: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
    pub restart_policy: String,
}

/// Where a job's compute runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// Shared default path; no pool is provisioned.
    Shared,
    /// A dedicated elastic pool sized by the plan.
    Elastic(SizingPlan),
}

impl Placement {
    pub fn bounds(&self) -> WorkerBounds {
        match self {
            Self::Shared => SHARED_BOUNDS,
            Self::Elastic(plan) => plan.bounds(),
        }
    }

    pub fn is_elastic(&self) -> bool {
        matches!(self, Self::Elastic(_))
    }
}

/// Decide the placement for a job of `total_bytes`.
///
/// Never fails: the image reference is parsed when the config is loaded.
pub fn estimate(total_bytes: u64, config: &SizingConfig, image: &ImageRef) -> Placement {
    if bytes_to_gib(total_bytes) <= config.data_threshold_gb {
        Placement::Shared
    } else {
        Placement::Elastic(plan(total_bytes, config, image))
    }
}

/// Pool bounds and per-worker resources, regardless of the threshold.
pub fn plan(total_bytes: u64, config: &SizingConfig, image: &ImageRef) -> SizingPlan {
    let total_gb = bytes_to_gib(total_bytes);
    let memory_limit_gb = config.memory_limit_gb;

    // f64 → u32 casts saturate, so absurd sizes clamp instead of wrapping.
    let max_workers = ((total_gb / memory_limit_gb).ceil() as u32).max(1);
    let min_workers = max_workers.div_ceil(10).max(1);

    let mut memory_request_gb = memory_limit_gb / 2.0;
    let mut cpu_request = config.cpu_limit / 2.0;
    if total_gb <= memory_limit_gb {
        memory_request_gb /= 2.0;
        cpu_request /= 2.0;
    }

    SizingPlan {
        total_bytes,
        min_workers,
        max_workers,
        memory_limit_gb,
        memory_request_gb,
        cpu_limit: config.cpu_limit,
        cpu_request,
        image: image.clone(),
        threads_per_worker: config.threads_per_worker,
        node_selector: config.node_selector.clone(),
    }
}
