//! Job submission, polling and cancellation.
//!
//! `JobManager` is the only entry point the API uses. Submissions are
//! deduplicated by request fingerprint; a new job is spawned on its own
//! task and waits for one of `max_concurrent_jobs` run slots, staying
//! `pending` meanwhile. Polls read the persisted record and never block.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tidepool_core::time::now_millis;
use tidepool_core::{FetchRequest, JobsConfig, human_bytes};
use tidepool_state::{DedupOutcome, JobId, JobRecord, JobState, PurgeStats};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelHandle, CancelSignal};
use crate::error::{JobError, JobResult};
use crate::job::JobTracker;
use crate::runner::{JobContext, supervise};

const RESTART_FAILURE: &str = "Job interrupted by a service restart.";

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    /// `false` when an identical request was already being served.
    pub created: bool,
}

/// What a poller sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub state: JobState,
    pub status: String,
    pub msg: String,
    pub result: Option<serde_json::Value>,
    pub progress: Vec<String>,
}

impl JobView {
    fn not_started(id: &str) -> Self {
        Self {
            state: JobState::Pending,
            status: JobState::Pending.status_label().to_string(),
            msg: format!("Job {id} has not started."),
            result: None,
            progress: Vec::new(),
        }
    }

    fn from_record(record: JobRecord) -> Self {
        if record.state == JobState::Pending {
            return Self::not_started(&record.id);
        }
        let msg = match record.state {
            JobState::Failed | JobState::Cancelled => record.error.clone(),
            _ => None,
        }
        .or_else(|| record.last_message().map(str::to_string))
        .unwrap_or_default();
        Self {
            state: record.state,
            status: record.state.status_label().to_string(),
            msg,
            result: record.result,
            progress: record.progress.into_iter().map(|p| p.message).collect(),
        }
    }
}

/// Pre-flight size estimate for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeReport {
    /// Dataset id → estimated bytes over the request's projection.
    pub data_sizes: BTreeMap<String, u64>,
    pub total: u64,
}

impl SizeReport {
    pub fn human_total(&self) -> String {
        human_bytes(self.total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The running job was signalled and stops at its next checkpoint.
    Requested,
    /// The job had no live runner and was cancelled in place.
    Cancelled,
    /// The job had already finished; nothing changed.
    AlreadyFinished(JobState),
}

#[derive(Clone)]
pub struct JobManager {
    ctx: Arc<JobContext>,
    permits: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<JobId, CancelHandle>>>,
    dedup_ttl_ms: i64,
    retention_ms: i64,
}

impl JobManager {
    pub fn new(ctx: JobContext, config: &JobsConfig) -> Self {
        Self {
            ctx: Arc::new(ctx),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            active: Arc::new(Mutex::new(HashMap::new())),
            dedup_ttl_ms: secs_to_millis(config.dedup_ttl_secs),
            retention_ms: secs_to_millis(config.result_retention_secs),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Return the job serving `request`, starting one if none is live.
    pub fn submit(&self, request: FetchRequest) -> JobResult<Submission> {
        let fingerprint = request.fingerprint();
        let now = now_millis();

        // Held across the dedup transaction so a cancel cannot observe the
        // new record before its handle is registered.
        let mut active = self.lock_active();
        let outcome = self.ctx.store.lookup_or_create(&fingerprint, now, self.dedup_ttl_ms, || {
            JobRecord::new(Uuid::new_v4().to_string(), fingerprint.clone(), now)
        })?;

        let record = match outcome {
            DedupOutcome::Existing(job_id) => {
                debug!(%job_id, %fingerprint, "request deduplicated");
                return Ok(Submission {
                    job_id,
                    created: false,
                });
            }
            DedupOutcome::Created(record) => record,
        };

        let job_id = record.id.clone();
        let cancel = CancelHandle::new();
        active.insert(job_id.clone(), cancel.clone());
        drop(active);

        info!(%job_id, %fingerprint, datasets = request.dataset_refs.len(), "job accepted");
        let manager = self.clone();
        tokio::spawn(async move { manager.drive(record, request, cancel).await });

        Ok(Submission {
            job_id,
            created: true,
        })
    }

    async fn drive(self, record: JobRecord, request: FetchRequest, cancel: CancelHandle) {
        let job_id = record.id.clone();
        let permit = tokio::select! {
            biased;
            signal = cancel.cancelled() => {
                let mut job = JobTracker::new(self.ctx.store.clone(), record);
                if let Err(e) = job.cancel(signal) {
                    error!(%job_id, error = %e, "failed to cancel pending job");
                }
                self.forget(&job_id);
                return;
            }
            permit = Arc::clone(&self.permits).acquire_owned() => permit,
        };

        match permit {
            Ok(_permit) => supervise(Arc::clone(&self.ctx), record, request, cancel).await,
            Err(e) => {
                let mut job = JobTracker::new(self.ctx.store.clone(), record);
                if let Err(e) = job.fail(format!("Job could not be scheduled: {e}")) {
                    error!(%job_id, error = %e, "failed to record scheduling failure");
                }
            }
        }
        self.forget(&job_id);
    }

    /// Snapshot of a job. Unknown ids read as not started.
    pub fn status(&self, job_id: &str) -> JobResult<JobView> {
        Ok(match self.ctx.store.get_job(job_id)? {
            Some(record) => JobView::from_record(record),
            None => JobView::not_started(job_id),
        })
    }

    /// Size every dataset of `request` without creating a job.
    pub async fn check_size(&self, request: &FetchRequest) -> JobResult<SizeReport> {
        let handles = self.ctx.resolve_all(request).await?;
        let data_sizes: BTreeMap<String, u64> = handles
            .iter()
            .map(|h| (h.dataset_id().to_string(), h.size_estimate()))
            .collect();
        let total = data_sizes.values().sum();
        Ok(SizeReport { data_sizes, total })
    }

    pub fn cancel(&self, job_id: &str, signal: CancelSignal) -> JobResult<CancelOutcome> {
        let active = self.lock_active();
        let record = self
            .ctx
            .store
            .get_job(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if record.state.is_terminal() {
            debug!(%job_id, state = %record.state, "cancel ignored for finished job");
            return Ok(CancelOutcome::AlreadyFinished(record.state));
        }
        if let Some(handle) = active.get(job_id) {
            handle.cancel(signal);
            info!(%job_id, %signal, "cancellation requested");
            return Ok(CancelOutcome::Requested);
        }
        drop(active);

        warn!(%job_id, %signal, "cancelling job without a runner");
        let mut job = JobTracker::new(self.ctx.store.clone(), record);
        job.cancel(signal)?;
        Ok(CancelOutcome::Cancelled)
    }

    /// Drop expired dedup entries and terminal jobs past retention.
    pub fn purge(&self) -> JobResult<PurgeStats> {
        let stats = self.ctx.store.purge_expired(now_millis(), self.retention_ms)?;
        if stats.jobs > 0 || stats.dedup_entries > 0 {
            info!(jobs = stats.jobs, dedup_entries = stats.dedup_entries, "purged expired state");
        }
        Ok(stats)
    }

    /// Fail jobs left unfinished by a previous process. Call once at
    /// startup, before accepting submissions.
    pub fn recover(&self) -> JobResult<usize> {
        let active = self.lock_active();
        let mut recovered = 0;
        for record in self.ctx.store.list_jobs()? {
            if record.state.is_terminal() || active.contains_key(&record.id) {
                continue;
            }
            let (job_id, fingerprint) = (record.id.clone(), record.fingerprint.clone());
            JobTracker::new(self.ctx.store.clone(), record).fail(RESTART_FAILURE)?;
            self.ctx.store.release_dedup(&fingerprint, &job_id)?;
            warn!(%job_id, "orphaned job failed on startup");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Jobs currently owned by a task (waiting or running).
    pub fn active_jobs(&self) -> usize {
        self.lock_active().len()
    }

    fn forget(&self, job_id: &str) {
        self.lock_active().remove(job_id);
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancelHandle>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000).saturating_mul(1_000)
}
