//! Error types for job orchestration.

use thiserror::Error;
use tidepool_core::{DatasetError, RequestError};
use tidepool_frame::FrameError;
use tidepool_pool::PoolError;
use tidepool_state::{JobState, StateError};

use crate::cancel::CancelSignal;

pub type JobResult<T> = Result<T, JobError>;
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Errors surfaced by the job manager and the job pipeline.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),

    #[error("{0} is not a valid value.")]
    UnknownSignal(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },

    #[error("{0}")]
    Validation(String),

    #[error("job cancelled by {0}")]
    Cancelled(CancelSignal),

    #[error("compute step failed: {0}")]
    Compute(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Errors from dataset resolvers.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("dataset not found: {0}")]
    NotFound(String),

    #[error("invalid dataset id: {0:?}")]
    InvalidId(String),

    #[error("failed to read dataset {id}: {reason}")]
    Io { id: String, reason: String },

    #[error("failed to parse dataset {id}: {reason}")]
    Parse { id: String, reason: String },

    #[error("fetching dataset {id} timed out after {secs}s")]
    Timeout { id: String, secs: u64 },

    #[error("dataset {id} is malformed: {source}")]
    Malformed {
        id: String,
        #[source]
        source: DatasetError,
    },
}
