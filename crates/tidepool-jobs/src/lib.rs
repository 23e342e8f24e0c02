//! tidepool-jobs — job orchestration for Tidepool.
//!
//! A submitted [`FetchRequest`](tidepool_core::FetchRequest) is deduplicated
//! by fingerprint, recorded as a pending job, and run on its own task:
//! resolve datasets, size the compute, acquire a pool when the request is
//! large, fetch, validate, merge, render. Progress is persisted after every
//! step so pollers can follow along.
//!
//! - **`job`** — the job state machine and its single writer
//! - **`cancel`** — cancellation signals and handles
//! - **`resolver`** — the dataset resolver seam and two catalogs
//! - **`runner`** — the per-job fetch → merge → render pipeline
//! - **`manager`** — submission, polling, cancellation and purging

pub mod cancel;
pub mod error;
pub mod job;
pub mod manager;
pub mod resolver;
pub mod runner;

pub use cancel::{CancelHandle, CancelSignal};
pub use error::{JobError, JobResult, ResolveError, ResolveResult};
pub use job::JobTracker;
pub use manager::{CancelOutcome, JobManager, JobView, SizeReport, Submission};
pub use resolver::{DatasetHandle, DatasetResolver, DirectoryCatalog, MemoryCatalog};
pub use runner::JobContext;
