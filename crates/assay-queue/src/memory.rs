//! In-memory queue implementation (the local backend)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendKind, QueueBackend, QueueError, QueueStats};
use crate::job::{JobEntry, JobId, JobStatus, Transition};

/// How long finished jobs stay visible to `get` by default
pub const DEFAULT_TERMINAL_TTL: Duration = Duration::from_secs(3600);

/// Heap entry - orders by run_at time (earliest first), then by insertion
#[derive(Debug, Clone, Eq, PartialEq)]
struct PriorityEntry {
    run_at: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: earlier run_at = higher priority
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

enum Claim {
    Job(JobEntry),
    /// Nothing ready yet; the earliest entry becomes ready at this time
    WaitUntil(DateTime<Utc>),
    Empty,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, JobEntry>,
    queue: BinaryHeap<PriorityEntry>,
    in_flight: HashSet<Uuid>,
    next_seq: u64,
}

impl State {
    fn push(&mut self, id: Uuid, run_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(PriorityEntry { run_at, seq, id });
    }

    fn claim_next(&mut self, now: DateTime<Utc>) -> Claim {
        loop {
            match self.queue.peek() {
                None => return Claim::Empty,
                Some(top) if top.run_at > now => return Claim::WaitUntil(top.run_at),
                Some(_) => {}
            }
            let Some(entry) = self.queue.pop() else {
                return Claim::Empty;
            };

            // Cancelled or evicted jobs leave stale heap entries behind
            let Some(job) = self.jobs.get_mut(&entry.id) else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }

            match job.transition(Transition::Start) {
                Ok(()) => {
                    self.in_flight.insert(entry.id);
                    return Claim::Job(job.clone());
                }
                Err(e) => {
                    warn!(
                        job_id = %entry.id,
                        error = %e,
                        "Pending job could not start, marking failed"
                    );
                    let _ = job.transition(Transition::Fail("attempt limit reached".to_string()));
                }
            }
        }
    }

    fn prune(&mut self, ttl: Duration) {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return;
        };
        let cutoff = Utc::now() - ttl;
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.is_terminal() && job.updated_at < cutoff));
        let evicted = before - self.jobs.len();
        if evicted > 0 {
            debug!(evicted, "Evicted finished jobs from local queue");
        }
    }
}

/// Local backend: a mutex-guarded heap plus a notifier for waiting workers.
///
/// Jobs live only in this process and are lost on a crash.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    terminal_ttl: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_terminal_ttl(DEFAULT_TERMINAL_TTL)
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep finished jobs queryable for `ttl` before evicting them
    pub fn with_terminal_ttl(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            terminal_ttl: ttl,
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn enqueue(&self, job: JobEntry) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.prune(self.terminal_ttl);
            if state.jobs.contains_key(&job.id) {
                return Err(QueueError::Backend(format!("job {} already queued", job.id)));
            }
            let (id, run_at) = (job.id, job.run_at);
            state.jobs.insert(id, job);
            state.push(id, run_at);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobEntry>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before looking so a concurrent enqueue
            // cannot slip between the check and the wait.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready_at = {
                let mut state = self.state.lock().await;
                match state.claim_next(Utc::now()) {
                    Claim::Job(job) => return Ok(Some(job)),
                    Claim::WaitUntil(at) => Some(at),
                    Claim::Empty => None,
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wait = deadline - now;
            if let Some(at) = ready_at {
                let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                wait = wait.min(until.max(Duration::from_millis(1)));
            }

            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn ack(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&id);
        state.prune(self.terminal_ttl);
        Ok(())
    }

    async fn nack(&self, id: JobId, requeue: bool, delay: Duration) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.in_flight.remove(&id);
            if !requeue {
                return Ok(());
            }

            let earliest = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            let run_at = match state.jobs.get_mut(&id) {
                Some(job) if job.status == JobStatus::Pending => {
                    job.run_at = job.run_at.max(earliest);
                    job.run_at
                }
                Some(job) => {
                    debug!(
                        job_id = %id,
                        status = %job.status,
                        "Ignoring requeue of non-pending job"
                    );
                    return Ok(());
                }
                None => return Err(QueueError::NotFound),
            };
            state.push(id, run_at);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn transition(&self, id: JobId, transition: Transition) -> Result<JobEntry, QueueError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
        job.transition(transition)?;
        Ok(job.clone())
    }

    async fn record_outcome(
        &self,
        id: JobId,
        attempt: u32,
        transition: Transition,
    ) -> Result<JobEntry, QueueError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
        job.transition_claim(attempt, transition)?;
        Ok(job.clone())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobEntry>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            backend: BackendKind::Local,
            ..Default::default()
        };
        for job in state.jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_enqueue_dequeue() {
        let queue = MemoryQueue::new();
        let job = JobEntry::new(json!({ "foo": "bar" }), 3);
        let id = job.id;

        queue.enqueue(job).await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Pending);

        // Dequeue
        let job = queue.dequeue(SHORT).await.unwrap().expect("Should have job");
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);

        // Dequeue empty
        let empty = queue.dequeue(SHORT).await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_delayed_job() {
        let queue = MemoryQueue::new();
        queue.enqueue(JobEntry::new(json!({}), 3)).await.unwrap();

        let job = queue.dequeue(SHORT).await.unwrap().unwrap();
        queue
            .transition(
                job.id,
                Transition::Retry {
                    delay: Duration::from_millis(300),
                },
            )
            .await
            .unwrap();
        queue
            .nack(job.id, true, Duration::from_millis(300))
            .await
            .unwrap();

        // Should be none immediately
        assert!(queue.dequeue(SHORT).await.unwrap().is_none());

        // The waiter wakes up on its own once the entry matures
        let job = queue
            .dequeue(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("Should have delayed job");
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped() {
        let queue = MemoryQueue::new();
        let first = JobEntry::new(json!({"n": 1}), 3);
        let second = JobEntry::new(json!({"n": 2}), 3);
        let (first_id, second_id) = (first.id, second.id);
        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();

        queue.transition(first_id, Transition::Cancel).await.unwrap();

        let job = queue.dequeue(SHORT).await.unwrap().unwrap();
        assert_eq!(job.id, second_id);
        assert!(queue.dequeue(SHORT).await.unwrap().is_none());
        assert_eq!(
            queue.get(first_id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_record_outcome_checks_the_claim() {
        let queue = MemoryQueue::new();
        queue.enqueue(JobEntry::new(json!({}), 3)).await.unwrap();
        let first = queue.dequeue(SHORT).await.unwrap().unwrap();

        queue
            .transition(first.id, Transition::Retry { delay: Duration::ZERO })
            .await
            .unwrap();
        queue.nack(first.id, true, Duration::ZERO).await.unwrap();
        let second = queue.dequeue(SHORT).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        let err = queue
            .record_outcome(first.id, first.attempts, Transition::Complete(json!("stale")))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::StaleClaim { attempt: 1, .. }));

        let done = queue
            .record_outcome(second.id, second.attempts, Transition::Complete(json!("fresh")))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(json!("fresh")));
    }

    #[tokio::test]
    async fn test_waiting_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = JobEntry::new(json!({}), 1);
        let id = job.id;
        queue.enqueue(job).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake before its own timeout")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivered.id, id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeue_delivers_once() {
        let queue = Arc::new(MemoryQueue::new());
        let mut ids = HashSet::new();
        for i in 0..50 {
            let job = JobEntry::new(json!({ "n": i }), 1);
            ids.insert(job.id);
            queue.enqueue(job).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(job) = queue.dequeue(SHORT).await.unwrap() {
                    seen.push(job.id);
                }
                seen
            }));
        }

        let mut delivered = Vec::new();
        for task in tasks {
            delivered.extend(task.await.unwrap());
        }
        let unique: HashSet<_> = delivered.iter().copied().collect();
        assert_eq!(delivered.len(), 50, "every job delivered exactly once");
        assert_eq!(unique, ids);
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_evicted_after_ttl() {
        let queue = MemoryQueue::with_terminal_ttl(Duration::from_millis(10));
        let job = JobEntry::new(json!({}), 1);
        let id = job.id;
        queue.enqueue(job).await.unwrap();
        queue.dequeue(SHORT).await.unwrap().unwrap();
        queue
            .transition(id, Transition::Complete(json!("done")))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.ack(id).await.unwrap();
        assert!(queue.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let queue = MemoryQueue::new();
        for _ in 0..3 {
            queue.enqueue(JobEntry::new(json!({}), 1)).await.unwrap();
        }
        let job = queue.dequeue(SHORT).await.unwrap().unwrap();
        queue
            .transition(job.id, Transition::Fail("boom".into()))
            .await
            .unwrap();
        queue.dequeue(SHORT).await.unwrap().unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.backend, BackendKind::Local);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);
    }
}
