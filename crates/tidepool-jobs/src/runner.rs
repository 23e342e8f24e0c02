//! The fetch → merge → render pipeline for one job.
//!
//! Steps run in order and report progress through the job's
//! [`JobTracker`]. Cancellation is checked between steps. CPU-bound work
//! runs on the blocking pool; with an elastic pool, per-dataset
//! resampling fans out across the pool's workers. Any pool acquired for
//! the job is released before the terminal state is written, whatever the
//! outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tidepool_core::{
    ConfigError, Dataset, FetchRequest, ImageRef, SizingConfig, TIME_VARIABLE, TidepoolConfig,
    human_bytes,
};
use tidepool_frame::{FrameResult, RenderOptions, combine, grid_steps, merge, render, resample, time_grid};
use tidepool_pool::{Placement, PoolController, PoolHandle, estimate};
use tidepool_state::{JobRecord, StateStore};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelHandle;
use crate::error::{JobError, JobResult, ResolveError};
use crate::job::JobTracker;
use crate::resolver::{DatasetHandle, DatasetResolver};

const NO_DATA: &str = "One of the dataset does not contain data.";
const NOT_PLOTTABLE: &str = "Plot creation is not possible with specified parameters. Please try again.";
const EMPTY_MERGE: &str = "Merged dataset does not contain data.";
const INTERNAL_FAILURE: &str = "Job failed due to an internal error.";

/// Everything a job needs besides its own request.
pub struct JobContext {
    pub store: StateStore,
    pub resolver: Arc<dyn DatasetResolver>,
    pub pools: PoolController,
    pub sizing: SizingConfig,
    pub image: ImageRef,
    pub render: RenderOptions,
    pub chunk_len: usize,
    /// Cap on the common grid when several datasets are merged.
    pub max_grid_points: u64,
    /// Bound on each resolve and each slice.
    pub fetch_timeout: Duration,
}

impl JobContext {
    pub fn from_config(
        config: &TidepoolConfig,
        store: StateStore,
        resolver: Arc<dyn DatasetResolver>,
        pools: PoolController,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            store,
            resolver,
            pools,
            image: config.sizing.image()?,
            sizing: config.sizing.clone(),
            render: RenderOptions::from(&config.render),
            chunk_len: config.render.chunk_len,
            max_grid_points: config.render.max_grid_points,
            fetch_timeout: Duration::from_secs(config.jobs.fetch_timeout_secs),
        })
    }

    /// Resolve every requested dataset against the minimal projection,
    /// in request order.
    pub(crate) async fn resolve_all(
        &self,
        request: &FetchRequest,
    ) -> JobResult<Vec<Arc<dyn DatasetHandle>>> {
        let projection = request.axis.projection();
        let mut handles = Vec::with_capacity(request.dataset_refs.len());
        for id in &request.dataset_refs {
            let handle = tokio::time::timeout(self.fetch_timeout, self.resolver.resolve(id, &projection))
                .await
                .map_err(|_| ResolveError::Timeout {
                    id: id.clone(),
                    secs: self.fetch_timeout.as_secs(),
                })??;
            handles.push(handle);
        }
        Ok(handles)
    }
}

/// Run a job to a terminal state.
///
/// The pipeline runs on its own task so that a panic anywhere in it still
/// leaves the record failed instead of stuck in `running`.
pub(crate) async fn supervise(
    ctx: Arc<JobContext>,
    record: JobRecord,
    request: FetchRequest,
    cancel: CancelHandle,
) {
    let job_id = record.id.clone();
    let task = tokio::spawn(execute(Arc::clone(&ctx), record, request, cancel));
    if let Err(e) = task.await {
        error!(%job_id, error = %e, "job task aborted");
        match ctx.store.get_job(&job_id) {
            Ok(Some(record)) if !record.state.is_terminal() => {
                let mut job = JobTracker::new(ctx.store.clone(), record);
                if let Err(e) = job.fail(INTERNAL_FAILURE) {
                    error!(%job_id, error = %e, "failed to record job failure");
                }
            }
            Ok(_) => {}
            Err(e) => error!(%job_id, error = %e, "failed to reload job after abort"),
        }
    }
}

async fn execute(ctx: Arc<JobContext>, record: JobRecord, request: FetchRequest, cancel: CancelHandle) {
    let mut job = JobTracker::new(ctx.store.clone(), record);
    if let Err(e) = job.start() {
        error!(job_id = %job.id(), error = %e, "job could not start");
        return;
    }

    let mut pool = None;
    let outcome = run(&ctx, &mut job, &request, &cancel, &mut pool).await;
    if let Some(handle) = pool.take() {
        ctx.pools.release(handle).await;
    }

    let finished = match outcome {
        Ok(result) => job.succeed(result),
        Err(JobError::Cancelled(signal)) => job.cancel(signal),
        Err(e) => job.fail(e.to_string()),
    };
    if let Err(e) = finished {
        error!(job_id = %job.id(), error = %e, "failed to record job outcome");
    }
}

async fn run(
    ctx: &JobContext,
    job: &mut JobTracker,
    request: &FetchRequest,
    cancel: &CancelHandle,
    pool: &mut Option<PoolHandle>,
) -> JobResult<serde_json::Value> {
    cancel.checkpoint()?;
    job.progress(format!("{} datasets requested.", request.dataset_refs.len()))?;

    // ── Size ──
    let handles = ctx.resolve_all(request).await?;
    let total: u64 = handles.iter().map(|h| h.size_estimate()).sum();
    job.progress(format!("Estimated data size: {}.", human_bytes(total)))?;
    cancel.checkpoint()?;

    if let Placement::Elastic(plan) = estimate(total, &ctx.sizing, &ctx.image) {
        job.progress(format!(
            "Setting up distributed computing cluster. Max data size: {}",
            human_bytes(total)
        ))?;
        let handle = ctx.pools.acquire(job.id(), &plan).await?;
        info!(job_id = %job.id(), workers = handle.workers(), "compute pool ready");
        *pool = Some(handle);
        cancel.checkpoint()?;
    }

    // ── Fetch ──
    job.progress("Retrieving data ...")?;
    let fetched = fetch_all(&handles, request, ctx.fetch_timeout).await?;
    cancel.checkpoint()?;

    // ── Validate ──
    job.progress("Validating datasets...")?;
    let datasets = validate(job, request, fetched, ctx.max_grid_points)?;
    let nbytes: u64 = datasets.values().map(Dataset::nbytes).sum();
    job.progress(format!("There are {} of data to be processed.", human_bytes(nbytes)))?;
    cancel.checkpoint()?;

    // ── Merge ──
    let merged = merge_datasets(ctx, datasets, request, pool.as_ref()).await?;
    if merged.is_empty() {
        job.progress(EMPTY_MERGE)?;
        return Err(JobError::Validation(EMPTY_MERGE.to_string()));
    }
    cancel.checkpoint()?;

    // ── Render ──
    job.progress("Plotting merged datasets...")?;
    let axis = request.axis.clone();
    let options = ctx.render;
    let payload = blocking(move || render(&merged, &axis, &options).map(|f| f.into_payload(&axis))).await?;
    debug!(job_id = %job.id(), count = payload.count, shaded = payload.shaded, "payload rendered");
    cancel.checkpoint()?;

    serde_json::to_value(payload).map_err(|e| JobError::Compute(e.to_string()))
}

/// Slice every dataset to the request window concurrently.
async fn fetch_all(
    handles: &[Arc<dyn DatasetHandle>],
    request: &FetchRequest,
    timeout: Duration,
) -> JobResult<Vec<(String, Option<Dataset>)>> {
    let tasks: Vec<_> = handles
        .iter()
        .map(|handle| {
            let handle = Arc::clone(handle);
            let window = request.window;
            tokio::spawn(async move {
                let id = handle.dataset_id().to_string();
                match tokio::time::timeout(timeout, handle.slice(&window)).await {
                    Ok(sliced) => sliced.map(|data| (id, data)),
                    Err(_) => Err(ResolveError::Timeout {
                        id,
                        secs: timeout.as_secs(),
                    }),
                }
            })
        })
        .collect();

    let mut fetched = Vec::with_capacity(tasks.len());
    for task in tasks {
        fetched.push(task.await.map_err(compute_error)??);
    }
    Ok(fetched)
}

/// Reject inputs that cannot produce a plot. Returns datasets keyed by id,
/// which is the canonical merge order.
fn validate(
    job: &mut JobTracker,
    request: &FetchRequest,
    fetched: Vec<(String, Option<Dataset>)>,
    max_grid_points: u64,
) -> JobResult<BTreeMap<String, Dataset>> {
    if fetched.iter().any(|(_, data)| data.is_none()) {
        return Err(JobError::Validation(NO_DATA.to_string()));
    }
    let datasets: Vec<(String, Dataset)> = fetched
        .into_iter()
        .filter_map(|(id, data)| data.map(|d| (id, d)))
        .collect();

    let empty: Vec<&str> = datasets
        .iter()
        .filter(|(_, d)| d.is_empty())
        .map(|(id, _)| id.as_str())
        .collect();
    if !empty.is_empty() {
        job.progress(format!("Empty data stream(s) found: {}.", empty.join(",")))?;
        return Err(JobError::Validation(NOT_PLOTTABLE.to_string()));
    }

    if let Some(axis) = request.axis.missing_axes().first() {
        return Err(JobError::Validation(format!(
            "No variable selected for the {axis} axis."
        )));
    }
    for var in request.axis.projection() {
        let present = var == TIME_VARIABLE || datasets.iter().any(|(_, d)| d.variable(&var).is_some());
        if !present {
            return Err(JobError::Validation(format!(
                "Variable {var} is not available in the requested datasets."
            )));
        }
    }

    if datasets.len() > 1 && grid_steps(&request.window, max_grid_points).is_err() {
        return Err(JobError::Validation(format!(
            "Time range too long to merge {} datasets: the common time grid is limited to {max_grid_points} points.",
            datasets.len()
        )));
    }

    Ok(datasets.into_iter().collect())
}

async fn merge_datasets(
    ctx: &JobContext,
    datasets: BTreeMap<String, Dataset>,
    request: &FetchRequest,
    pool: Option<&PoolHandle>,
) -> JobResult<Dataset> {
    let window = request.window;
    let chunk_len = ctx.chunk_len;
    let max_points = ctx.max_grid_points;
    let pool = match pool {
        Some(pool) if datasets.len() > 1 => pool,
        _ => return blocking(move || merge(datasets, &window, chunk_len, max_points)).await,
    };

    let grid = Arc::new(time_grid(&window, max_points)?);
    let workers = Arc::new(Semaphore::new(pool.workers()));
    debug!(datasets = datasets.len(), workers = pool.workers(), "fanning out resample");
    let tasks: Vec<_> = datasets
        .into_values()
        .map(|dataset| {
            let grid = Arc::clone(&grid);
            let workers = Arc::clone(&workers);
            tokio::spawn(async move {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|e| JobError::Compute(e.to_string()))?;
                tokio::task::spawn_blocking(move || resample(&dataset, &grid))
                    .await
                    .map_err(compute_error)
            })
        })
        .collect();

    let mut aligned = Vec::with_capacity(tasks.len());
    for task in tasks {
        aligned.push(task.await.map_err(compute_error)??);
    }
    blocking(move || combine(aligned, chunk_len)).await
}

async fn blocking<T, F>(f: F) -> JobResult<T>
where
    F: FnOnce() -> FrameResult<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await.map_err(compute_error)??)
}

fn compute_error(e: JoinError) -> JobError {
    if e.is_panic() {
        warn!(error = %e, "compute task panicked");
        JobError::Compute("compute task panicked".to_string())
    } else {
        JobError::Compute(e.to_string())
    }
}
