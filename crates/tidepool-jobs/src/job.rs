//! Single writer for one job record.
//!
//! Every mutation goes through [`JobTracker`], which checks the lifecycle
//! graph, appends to the progress log and persists the record before
//! returning. Pollers only ever read what the tracker last stored.

use tidepool_core::time::now_millis;
use tidepool_state::{JobId, JobRecord, JobState, ProgressEntry, StateStore};
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::error::{JobError, JobResult};

pub struct JobTracker {
    store: StateStore,
    record: JobRecord,
}

impl JobTracker {
    pub fn new(store: StateStore, record: JobRecord) -> Self {
        Self { store, record }
    }

    pub fn id(&self) -> &JobId {
        &self.record.id
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// `pending → running`.
    pub fn start(&mut self) -> JobResult<()> {
        self.transition(JobState::Running)?;
        self.record.started_at = Some(now_millis());
        self.persist()?;
        info!(job_id = %self.record.id, "job started");
        Ok(())
    }

    /// Append a progress message. Rejected once the job is terminal.
    pub fn progress(&mut self, message: impl Into<String>) -> JobResult<()> {
        if self.record.state.is_terminal() {
            return Err(JobError::InvalidTransition {
                id: self.record.id.clone(),
                from: self.record.state,
                to: self.record.state,
            });
        }
        let message = message.into();
        debug!(job_id = %self.record.id, %message, "progress");
        self.push(message);
        self.persist()
    }

    pub fn succeed(&mut self, result: serde_json::Value) -> JobResult<()> {
        self.transition(JobState::Succeeded)?;
        self.push("Result ready.".to_string());
        self.record.result = Some(result);
        self.finish()?;
        info!(job_id = %self.record.id, "job succeeded");
        Ok(())
    }

    /// Move to `failed` with `reason` as the final message.
    pub fn fail(&mut self, reason: impl Into<String>) -> JobResult<()> {
        let reason = reason.into();
        self.transition(JobState::Failed)?;
        if self.record.last_message() != Some(reason.as_str()) {
            self.push(reason.clone());
        }
        self.record.result = None;
        self.record.error = Some(reason);
        self.finish()?;
        warn!(job_id = %self.record.id, error = ?self.record.error, "job failed");
        Ok(())
    }

    pub fn cancel(&mut self, signal: CancelSignal) -> JobResult<()> {
        self.transition(JobState::Cancelled)?;
        let message = format!("Job cancelled by {signal}.");
        self.push(message.clone());
        self.record.result = None;
        self.record.error = Some(message);
        self.record.cancel_signal = Some(signal.to_string());
        self.finish()?;
        info!(job_id = %self.record.id, %signal, "job cancelled");
        Ok(())
    }

    fn transition(&mut self, next: JobState) -> JobResult<()> {
        let from = self.record.state;
        if !from.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: self.record.id.clone(),
                from,
                to: next,
            });
        }
        self.record.state = next;
        Ok(())
    }

    fn push(&mut self, message: String) {
        self.record.progress.push(ProgressEntry {
            at: now_millis(),
            message,
        });
    }

    fn finish(&mut self) -> JobResult<()> {
        self.record.finished_at = Some(now_millis());
        self.persist()
    }

    fn persist(&self) -> JobResult<()> {
        self.store.put_job(&self.record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (StateStore, JobTracker) {
        let store = StateStore::open_in_memory().unwrap();
        let record = JobRecord::new("job-1", "fp", now_millis());
        store.put_job(&record).unwrap();
        (store.clone(), JobTracker::new(store, record))
    }

    #[test]
    fn progress_is_persisted_in_order() {
        let (store, mut job) = tracker();
        job.start().unwrap();
        job.progress("2 datasets requested.").unwrap();
        job.progress("Retrieving data ...").unwrap();

        let stored = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(stored.state, JobState::Running);
        assert!(stored.started_at.is_some());
        let messages: Vec<_> = stored.progress.iter().map(|p| p.message.as_str()).collect();
        assert_eq!(messages, ["2 datasets requested.", "Retrieving data ..."]);
    }

    #[test]
    fn success_stores_result() {
        let (store, mut job) = tracker();
        job.start().unwrap();
        job.succeed(serde_json::json!({"count": 3})).unwrap();

        let stored = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(stored.state, JobState::Succeeded);
        assert_eq!(stored.result, Some(serde_json::json!({"count": 3})));
        assert_eq!(stored.last_message(), Some("Result ready."));
        assert!(stored.finished_at.is_some());
    }

    #[test]
    fn failure_does_not_repeat_last_message() {
        let (store, mut job) = tracker();
        job.start().unwrap();
        job.progress("Merged dataset does not contain data.").unwrap();
        job.fail("Merged dataset does not contain data.").unwrap();

        let stored = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.progress.len(), 1);
        assert_eq!(stored.result, None);
        assert_eq!(stored.error.as_deref(), Some("Merged dataset does not contain data."));
    }

    #[test]
    fn pending_job_can_be_cancelled() {
        let (store, mut job) = tracker();
        job.cancel(CancelSignal::Kill).unwrap();

        let stored = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(stored.state, JobState::Cancelled);
        assert_eq!(stored.cancel_signal.as_deref(), Some("SIGKILL"));
        assert_eq!(stored.last_message(), Some("Job cancelled by SIGKILL."));
    }

    #[test]
    fn terminal_jobs_reject_mutation() {
        let (store, mut job) = tracker();
        job.start().unwrap();
        job.succeed(serde_json::Value::Null).unwrap();

        assert!(matches!(job.progress("late"), Err(JobError::InvalidTransition { .. })));
        assert!(matches!(job.fail("late"), Err(JobError::InvalidTransition { .. })));
        assert!(matches!(
            job.cancel(CancelSignal::Term),
            Err(JobError::InvalidTransition { .. })
        ));
        let stored = store.get_job("job-1").unwrap().unwrap();
        assert_eq!(stored.state, JobState::Succeeded);
        assert_eq!(stored.progress.len(), 1);
    }

    #[test]
    fn cannot_succeed_without_starting() {
        let (_, mut job) = tracker();
        assert!(matches!(
            job.succeed(serde_json::Value::Null),
            Err(JobError::InvalidTransition {
                from: JobState::Pending,
                to: JobState::Succeeded,
                ..
            })
        ));
    }
}
