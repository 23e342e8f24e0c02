//! Error types for pool provisioning.

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Failures that abort a job's pool acquisition. None are retried.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to provision cluster: {0}")]
    Provision(String),

    #[error("failed to scale cluster {cluster}: {reason}")]
    Scale { cluster: String, reason: String },

    #[error("cluster {cluster} did not reach {workers} ready workers: {reason}")]
    NotReady {
        cluster: String,
        workers: u32,
        reason: String,
    },
}
