//! tidepool-frame — CPU-bound data work for a job.
//!
//! - **`merge`** — resamples heterogeneous datasets onto one 1-second grid
//!   and merges them
//! - **`render`** — picks point-wise or aggregated rendering and extracts
//!   the plotted columns
//! - **`cell`** — output cells, with `NaN` turned into explicit nulls
//!
//! Everything here is synchronous; callers run it on a blocking thread.

pub mod cell;
pub mod error;
pub mod merge;
pub mod render;

pub use cell::{Cell, sanitize};
pub use error::{FrameError, FrameResult};
pub use merge::{combine, grid_steps, merge, resample, time_grid, unify_chunks};
pub use render::{PlotPayload, RenderOptions, RenderStrategy, RenderedFrame, render, select_strategy};
