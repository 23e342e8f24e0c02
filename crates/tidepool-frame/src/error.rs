//! Error types for merging and rendering.

use thiserror::Error;
use tidepool_core::DatasetError;

/// Result type alias for frame operations.
pub type FrameResult<T> = Result<T, FrameError>;

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("nothing to merge")]
    EmptyInput,

    #[error("axis {0} has no variable assigned")]
    EmptyAxis(&'static str),

    #[error("request window needs more than {limit} one-second grid points")]
    GridTooLarge { limit: u64 },

    #[error("variable {0} is not present in the merged dataset")]
    MissingVariable(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}
