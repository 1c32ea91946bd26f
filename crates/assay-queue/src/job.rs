//! Job definitions and lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::QueueError;

/// Job Identifier
pub type JobId = Uuid;

/// Attempts allowed per job when the caller does not say otherwise
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in queue
    Pending,
    /// Currently being processed
    Running,
    /// Successfully completed
    Completed,
    /// Failed after the last permitted attempt
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl JobStatus {
    /// Terminal states have no outgoing edges
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the state machine has an edge from `self` to `next`
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested lifecycle edge together with the data it records
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Begin an execution attempt (`pending -> running`)
    Start,
    /// Record the handler output (`running -> completed`)
    Complete(serde_json::Value),
    /// Record the final error (`pending|running -> failed`)
    Fail(String),
    /// Return the job to the queue after a failed attempt (`running -> pending`)
    Retry { delay: Duration },
    /// External cancellation (`pending|running -> cancelled`)
    Cancel,
}

impl Transition {
    /// Status the job ends up in if the transition is accepted
    pub fn target(&self) -> JobStatus {
        match self {
            Self::Start => JobStatus::Running,
            Self::Complete(_) => JobStatus::Completed,
            Self::Fail(_) => JobStatus::Failed,
            Self::Retry { .. } => JobStatus::Pending,
            Self::Cancel => JobStatus::Cancelled,
        }
    }
}

/// A stored job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: JobId,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job may be delivered to a worker
    pub run_at: DateTime<Utc>,
}

impl JobEntry {
    /// Create a pending job with a fresh id
    pub fn new(payload: serde_json::Value, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            run_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a lifecycle edge.
    ///
    /// Rejected edges return `InvalidTransition` and leave the job untouched.
    /// `Start` is also rejected once every attempt has been used, so
    /// `attempts` never exceeds `max_attempts`.
    pub fn transition(&mut self, transition: Transition) -> Result<(), QueueError> {
        let from = self.status;
        let to = transition.target();

        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidTransition { from, to });
        }
        if matches!(transition, Transition::Start) && self.attempts >= self.max_attempts {
            return Err(QueueError::InvalidTransition { from, to });
        }

        let now = Utc::now();
        match transition {
            Transition::Start => self.attempts += 1,
            Transition::Complete(output) => self.result = Some(output),
            Transition::Fail(error) => self.error = Some(error),
            Transition::Retry { delay } => {
                let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                self.run_at = now + delay;
            }
            Transition::Cancel => {}
        }

        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Apply the outcome of execution attempt number `attempt`.
    ///
    /// Only the claim that is still running that attempt may record an
    /// outcome. A job that was reclaimed (back to pending, or running a later
    /// attempt) refuses with `StaleClaim`; a finished job refuses with
    /// `InvalidTransition`.
    pub fn transition_claim(
        &mut self,
        attempt: u32,
        transition: Transition,
    ) -> Result<(), QueueError> {
        let current = self.status == JobStatus::Running && self.attempts == attempt;
        if !current && !self.is_terminal() {
            return Err(QueueError::StaleClaim {
                attempt,
                status: self.status,
            });
        }
        self.transition(transition)
    }

    /// Front-end view of the job, without its payload
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            status: self.status,
            attempts: Some(self.attempts),
            max_attempts: Some(self.max_attempts),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: Some(self.created_at),
            updated_at: Some(self.updated_at),
        }
    }
}

/// Lifecycle snapshot returned by `QueueManager::status`.
///
/// Jobs that have left the queue's cache are rebuilt from the result store,
/// which only knows the output; the bookkeeping fields are `None` then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: Option<u32>,
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    /// Snapshot of a completed job known only to the result store
    pub fn from_stored(id: JobId, output: serde_json::Value) -> Self {
        Self {
            id,
            status: JobStatus::Completed,
            attempts: None,
            max_attempts: None,
            result: Some(output),
            error: None,
            created_at: None,
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_job() -> JobEntry {
        let mut job = JobEntry::new(json!({"file": "report.pdf"}), 3);
        job.transition(Transition::Start).unwrap();
        job
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = JobEntry::new(json!({}), 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_start_increments_attempts() {
        let job = running_job();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert!(job.updated_at >= job.created_at);
    }

    #[test]
    fn test_complete_sets_result_only() {
        let mut job = running_job();
        job.transition(Transition::Complete(json!({"summary": "ok"})))
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"summary": "ok"})));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_fail_sets_error_only() {
        let mut job = running_job();
        job.transition(Transition::Fail("model timeout".into())).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("model timeout"));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_retry_returns_to_pending_with_delay() {
        let mut job = running_job();
        let before = job.run_at;
        job.transition(Transition::Retry {
            delay: Duration::from_secs(30),
        })
        .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.run_at >= before + chrono::Duration::seconds(30));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_terminal_states_reject_every_edge() {
        let edges = [
            Transition::Start,
            Transition::Complete(json!(null)),
            Transition::Fail("x".into()),
            Transition::Retry {
                delay: Duration::ZERO,
            },
            Transition::Cancel,
        ];

        let terminals = [
            Transition::Complete(json!(1)),
            Transition::Fail("e".into()),
            Transition::Cancel,
        ];
        for terminal in terminals {
            let mut job = running_job();
            job.transition(terminal).unwrap();
            let frozen = job.clone();

            for edge in edges.iter().cloned() {
                let err = job.transition(edge).unwrap_err();
                assert!(matches!(err, QueueError::InvalidTransition { .. }));
                assert_eq!(job, frozen, "rejected edge must not change the job");
            }
        }
    }

    #[test]
    fn test_pending_cannot_complete() {
        let mut job = JobEntry::new(json!({}), 3);
        let err = job.transition(Transition::Complete(json!({}))).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Completed
            }
        ));
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        let mut job = JobEntry::new(json!({}), 2);
        for _ in 0..2 {
            job.transition(Transition::Start).unwrap();
            job.transition(Transition::Retry {
                delay: Duration::ZERO,
            })
            .unwrap();
        }
        assert!(job.transition(Transition::Start).is_err());
        assert_eq!(job.attempts, 2);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_outcome_of_reclaimed_attempt_is_refused() {
        let mut job = running_job();
        // Reclaimed after its visibility timeout, before the worker reports
        job.transition(Transition::Retry {
            delay: Duration::ZERO,
        })
        .unwrap();
        let err = job
            .transition_claim(1, Transition::Complete(json!("late")))
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::StaleClaim {
                attempt: 1,
                status: JobStatus::Pending
            }
        ));

        // Redelivered: only the newer claim may settle it
        job.transition(Transition::Start).unwrap();
        assert!(matches!(
            job.transition_claim(1, Transition::Fail("late".into())),
            Err(QueueError::StaleClaim { .. })
        ));
        job.transition_claim(2, Transition::Complete(json!("fresh")))
            .unwrap();
        assert_eq!(job.result, Some(json!("fresh")));

        let err = job.transition_claim(2, Transition::Cancel).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[test]
    fn test_snapshot_omits_payload() {
        let job = running_job();
        let json = serde_json::to_value(job.snapshot()).unwrap();
        assert!(json.get("payload").is_none());
        assert_eq!(json["status"], "running");
        assert_eq!(json["attempts"], 1);
    }
}
