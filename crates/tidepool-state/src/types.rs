//! Persisted types for the Tidepool state store.
//!
//! A `JobRecord` is written only by the task running the job; everyone
//! else reads snapshots of it. `DedupEntry` points a request fingerprint at
//! the job that serves it until the entry expires.

use serde::{Deserialize, Serialize};
use tidepool_core::EpochMillis;

/// Unique identifier for a job.
pub type JobId = String;

// ── Job ────────────────────────────────────────────────────────────

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Succeeded, failed and cancelled jobs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Label reported to pollers in the `status` field.
    pub fn status_label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One line of a job's progress log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEntry {
    pub at: EpochMillis,
    pub message: String,
}

/// Persisted view of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    /// Fingerprint of the request this job serves.
    pub fingerprint: String,
    pub state: JobState,
    /// Append-only, in emission order.
    pub progress: Vec<ProgressEntry>,
    /// Rendered payload, set only on success.
    pub result: Option<serde_json::Value>,
    /// Failure or cancellation reason.
    pub error: Option<String>,
    /// Signal name, when the job was cancelled.
    pub cancel_signal: Option<String>,
    pub created_at: EpochMillis,
    pub started_at: Option<EpochMillis>,
    pub finished_at: Option<EpochMillis>,
}

impl JobRecord {
    pub fn new(id: impl Into<JobId>, fingerprint: impl Into<String>, now: EpochMillis) -> Self {
        Self {
            id: id.into(),
            fingerprint: fingerprint.into(),
            state: JobState::Pending,
            progress: Vec::new(),
            result: None,
            error: None,
            cancel_signal: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Most recent progress message.
    pub fn last_message(&self) -> Option<&str> {
        self.progress.last().map(|p| p.message.as_str())
    }

    /// Whether the record is past its retention window at `now`.
    pub fn is_expired(&self, now: EpochMillis, retention_ms: i64) -> bool {
        match (self.state.is_terminal(), self.finished_at) {
            (true, Some(finished)) => finished.saturating_add(retention_ms) <= now,
            _ => false,
        }
    }
}

// ── Dedup ──────────────────────────────────────────────────────────

/// Fingerprint → job pointer with a bounded lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupEntry {
    pub fingerprint: String,
    pub job_id: JobId,
    pub expires_at: EpochMillis,
}

impl DedupEntry {
    pub fn is_live(&self, now: EpochMillis) -> bool {
        now < self.expires_at
    }
}
