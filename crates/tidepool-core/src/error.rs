//! Error types shared across Tidepool crates.

use thiserror::Error;

/// Result type alias for request parsing.
pub type RequestResult<T> = Result<T, RequestError>;

/// A request that can never be turned into a job.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid timestamp: {0}")]
    InvalidTime(String),

    #[error("start time {start} is after end time {end}")]
    InvalidWindow { start: String, end: String },

    #[error("no datasets requested")]
    NoDatasets,
}

/// Structural problems in a dataset.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatasetError {
    #[error("variable {variable} in {dataset} has {actual} values, expected {expected}")]
    LengthMismatch {
        dataset: String,
        variable: String,
        expected: usize,
        actual: usize,
    },

    #[error("{0} is reserved for the time coordinate")]
    ReservedName(String),
}

/// Errors raised while loading `tidepool.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
