//! Queue Backend Trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::handler::StoreError;
use crate::job::{JobEntry, JobId, JobStatus, Transition};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("Claim for attempt {attempt} is stale: job is {status}")]
    StaleClaim { attempt: u32, status: JobStatus },
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found")]
    NotFound,
    #[error("Job cannot be cancelled: already {0}")]
    CannotCancel(JobStatus),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    // Only the category is kept so record contents never end up in messages.
    #[error("Serialization error ({0:?})")]
    Serialization(serde_json::error::Category),
    #[error("Result store error: {0}")]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.classify())
    }
}

impl QueueError {
    /// Transport failures worth retrying at the transport boundary
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::Store(StoreError::Connection(_))
        )
    }
}

/// Which transport holds the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process queue, lost on restart
    #[default]
    Local,
    /// Networked broker (Redis)
    Remote,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "memory" | "in-memory" => Ok(Self::Local),
            "remote" | "redis" => Ok(Self::Remote),
            other => Err(QueueError::InvalidConfig(format!(
                "unknown queue backend '{}'",
                other
            ))),
        }
    }
}

/// Job counts per lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub backend: BackendKind,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub(crate) fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Transport kind, for logging and health reporting
    fn kind(&self) -> BackendKind;

    /// Store a pending job and make it eligible for delivery
    async fn enqueue(&self, job: JobEntry) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next eligible job.
    ///
    /// The job is claimed atomically (moved to `Running`, attempt counted)
    /// before it is returned, so each delivery reaches exactly one caller.
    /// Returns `Ok(None)` on timeout.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobEntry>, QueueError>;

    /// Drop the job from in-flight tracking after its outcome is recorded
    async fn ack(&self, id: JobId) -> Result<(), QueueError>;

    /// Drop the job from in-flight tracking; with `requeue` it becomes
    /// eligible for redelivery once `delay` has passed
    async fn nack(&self, id: JobId, requeue: bool, delay: Duration) -> Result<(), QueueError>;

    /// Atomically apply a lifecycle edge to the stored record
    async fn transition(&self, id: JobId, transition: Transition) -> Result<JobEntry, QueueError>;

    /// Atomically record the outcome of the claim that began `attempt`.
    ///
    /// Refused with `StaleClaim` when the claim was reclaimed in the
    /// meantime (see [`JobEntry::transition_claim`]).
    async fn record_outcome(
        &self,
        id: JobId,
        attempt: u32,
        transition: Transition,
    ) -> Result<JobEntry, QueueError>;

    /// Current record, if the backend still holds it
    async fn get(&self, id: JobId) -> Result<Option<JobEntry>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;

    /// Redeliver jobs claimed longer than `older_than` ago without an
    /// outcome. Backends without redelivery report zero.
    async fn requeue_stale(&self, _older_than: Duration) -> Result<usize, QueueError> {
        Ok(0)
    }
}
