//! Cooperative job cancellation.
//!
//! Cancelling never interrupts a step in flight. The runner checks the
//! handle at step boundaries and stops at the first checkpoint after a
//! request; a job still waiting for a run slot stops immediately.

use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, JobResult};

/// Signals a client may send to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelSignal {
    #[serde(rename = "SIGTERM")]
    Term,
    #[serde(rename = "SIGKILL")]
    Kill,
    #[serde(rename = "SIGUSR1")]
    Usr1,
}

impl CancelSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
            Self::Usr1 => "SIGUSR1",
        }
    }
}

impl std::fmt::Display for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancelSignal {
    type Err = JobError;

    fn from_str(s: &str) -> JobResult<Self> {
        match s {
            "SIGTERM" => Ok(Self::Term),
            "SIGKILL" => Ok(Self::Kill),
            "SIGUSR1" => Ok(Self::Usr1),
            other => Err(JobError::UnknownSignal(other.to_string())),
        }
    }
}

/// Shared between the manager (requests) and the runner (observes).
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    signal: Arc<OnceLock<CancelSignal>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first signal wins; returns whether this
    /// call was the first.
    pub fn cancel(&self, signal: CancelSignal) -> bool {
        let first = self.signal.set(signal).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn signal(&self) -> Option<CancelSignal> {
        self.signal.get().copied()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) -> CancelSignal {
        self.token.cancelled().await;
        self.signal().unwrap_or(CancelSignal::Term)
    }

    /// `Err(Cancelled)` if cancellation has been requested.
    pub fn checkpoint(&self) -> JobResult<()> {
        match self.signal() {
            Some(signal) if self.is_cancelled() => Err(JobError::Cancelled(signal)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_supported_signals() {
        assert_eq!("SIGTERM".parse::<CancelSignal>().unwrap(), CancelSignal::Term);
        assert_eq!("SIGKILL".parse::<CancelSignal>().unwrap(), CancelSignal::Kill);
        assert_eq!("SIGUSR1".parse::<CancelSignal>().unwrap(), CancelSignal::Usr1);
        let err = "SIGHUP".parse::<CancelSignal>().unwrap_err();
        assert_eq!(err.to_string(), "SIGHUP is not a valid value.");
    }

    #[test]
    fn first_signal_wins() {
        let handle = CancelHandle::new();
        assert!(handle.checkpoint().is_ok());

        assert!(handle.cancel(CancelSignal::Usr1));
        assert!(!handle.cancel(CancelSignal::Kill));
        assert_eq!(handle.signal(), Some(CancelSignal::Usr1));
        assert!(matches!(
            handle.checkpoint(),
            Err(JobError::Cancelled(CancelSignal::Usr1))
        ));
    }

    #[tokio::test]
    async fn clones_observe_cancellation() {
        let handle = CancelHandle::new();
        let observer = handle.clone();
        let waiter = tokio::spawn(async move { observer.cancelled().await });
        handle.cancel(CancelSignal::Term);
        assert_eq!(waiter.await.unwrap(), CancelSignal::Term);
    }

    #[test]
    fn signal_serializes_by_name() {
        assert_eq!(serde_json::to_string(&CancelSignal::Kill).unwrap(), "\"SIGKILL\"");
    }
}
