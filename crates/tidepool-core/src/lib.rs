//! tidepool-core — shared types for the Tidepool fetch-and-merge service.
//!
//! - **`request`** — axis mappings, time windows, fetch requests and their
//!   order-independent fingerprints
//! - **`dataset`** — the in-memory, time-indexed dataset model
//! - **`time`** — timestamp parsing and rendering
//! - **`config`** — `tidepool.toml` parsing with environment overrides
//! - **`size`** — human-readable byte sizes

pub mod config;
pub mod dataset;
pub mod error;
pub mod request;
pub mod size;
pub mod time;

pub use config::{ImageRef, JobsConfig, RenderConfig, SizingConfig, TidepoolConfig};
pub use dataset::{Attrs, Dataset, Variable};
pub use error::{ConfigError, DatasetError, RequestError, RequestResult};
pub use request::{AxisMapping, DataRequest, FetchRequest, TIME_VARIABLE, TimeWindow};
pub use size::human_bytes;
pub use time::EpochMillis;
