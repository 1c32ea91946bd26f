//! Worker Pool for processing jobs

use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendKind, QueueBackend, QueueError};
use crate::handler::{HandlerError, JobHandler, ResultStore};
use crate::job::{JobEntry, JobId, Transition};
use crate::retry::{RetryDecision, RetryPolicy, TransportRetry};

/// Pause after a failed dequeue before polling again
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Number of executors, i.e. jobs processed at once
    pub concurrency: usize,
    /// How long one dequeue call waits for work
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
    pub transport: TransportRetry,
    /// Claims older than this are redelivered (remote backend only)
    pub visibility_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            transport: TransportRetry::default(),
            visibility_timeout: Duration::from_secs(900),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// A fixed set of executors pulling from one backend.
///
/// Each executor handles one job at a time, so `concurrency` bounds the
/// number of jobs in flight. Shutdown lets in-flight jobs finish.
pub struct WorkerPool {
    tasks: Vec<JoinHandle<()>>,
    executors: usize,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn the executors (and the stale-claim reaper for remote backends)
    pub fn start(
        backend: Arc<dyn QueueBackend>,
        handler: Arc<dyn JobHandler>,
        store: Arc<dyn ResultStore>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let executors = config.concurrency.max(1);
        let mut tasks = Vec::with_capacity(executors + 1);

        for index in 0..executors {
            let executor = Executor {
                index,
                backend: backend.clone(),
                handler: handler.clone(),
                store: store.clone(),
                config,
                shutdown: shutdown.clone(),
            };
            tasks.push(tokio::spawn(executor.run()));
        }

        if backend.kind() == BackendKind::Remote {
            tasks.push(tokio::spawn(reap_stale(
                backend.clone(),
                config.reap_interval,
                config.visibility_timeout,
                shutdown.clone(),
            )));
        }

        info!(
            concurrency = executors,
            backend = %backend.kind(),
            "Worker pool started"
        );

        Self {
            tasks,
            executors,
            shutdown,
        }
    }

    /// Number of executors
    pub fn size(&self) -> usize {
        self.executors
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop taking new jobs and wait for in-flight ones to finish
    pub async fn shutdown(self) {
        info!("Worker pool shutting down");
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait for every executor to exit (after the token is cancelled)
    pub async fn join(self) {
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("executors", &self.executors)
            .field("stopping", &self.shutdown.is_cancelled())
            .finish()
    }
}

enum Recorded {
    Applied(JobEntry),
    /// Outcome dropped; the job was already settled some other way
    Discarded,
}

struct Executor {
    index: usize,
    backend: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    store: Arc<dyn ResultStore>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Executor {
    async fn run(self) {
        debug!(worker = self.index, "Worker started");

        // The token is only checked between jobs; a claimed job always runs
        // to an outcome.
        while !self.shutdown.is_cancelled() {
            match self.backend.dequeue(self.config.poll_timeout).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker = self.index, error = %e, "Failed to dequeue job");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(DEQUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        debug!(worker = self.index, "Worker stopped");
    }

    async fn process(&self, job: JobEntry) {
        info!(
            worker = self.index,
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let executed = AssertUnwindSafe(self.handler.execute(&job.payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::Retryable("handler panicked".to_string())));

        match executed {
            Ok(output) => self.complete(&job, output).await,
            Err(e) => self.fail(&job, e).await,
        }
    }

    /// Record completion, then persist the output.
    ///
    /// The output only reaches the store once the backend has accepted the
    /// outcome, so a cancelled or reclaimed attempt never leaves a result
    /// behind.
    async fn complete(&self, job: &JobEntry, output: serde_json::Value) {
        let completed = Transition::Complete(output.clone());
        let Recorded::Applied(done) = self.settle(job, completed, "complete").await else {
            return;
        };
        info!(job_id = %job.id, attempts = done.attempts, "Job completed");

        if let Err(e) = self.persist(job.id, &output).await {
            // The completed record still carries the output until it expires
            error!(job_id = %job.id, error = %e, "Failed to save job result");
        }
        self.acknowledge(job.id).await;
    }

    async fn fail(&self, job: &JobEntry, err: HandlerError) {
        match self.config.retry.decide(job, &err) {
            RetryDecision::Retry(delay) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Job attempt failed, scheduling retry"
                );
                let retry = Transition::Retry { delay };
                if let Recorded::Applied(_) = self.settle(job, retry, "retry").await {
                    self.requeue(job.id, delay).await;
                }
            }
            RetryDecision::GiveUp => {
                error!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Job failed"
                );
                let failed = Transition::Fail(err.message().to_string());
                if let Recorded::Applied(_) = self.settle(job, failed, "fail").await {
                    self.acknowledge(job.id).await;
                }
            }
        }
    }

    /// Record the outcome of the attempt in `job`, resolving conflicts with
    /// whoever changed the record while the handler ran
    async fn settle(
        &self,
        job: &JobEntry,
        transition: Transition,
        operation: &'static str,
    ) -> Recorded {
        let id = job.id;
        match self.record(job, transition, operation).await {
            Ok(done) => Recorded::Applied(done),
            Err(QueueError::InvalidTransition { from, .. }) if from.is_terminal() => {
                // Cancelled (or finished elsewhere) mid-run
                warn!(
                    job_id = %id,
                    status = %from,
                    operation,
                    "Job already finished, discarding outcome"
                );
                self.acknowledge(id).await;
                Recorded::Discarded
            }
            Err(QueueError::StaleClaim { attempt, status }) => {
                // Reclaimed after its visibility timeout; the processing
                // entry belongs to the redelivery now
                warn!(
                    job_id = %id,
                    attempt,
                    status = %status,
                    operation,
                    "Job claim was reclaimed, discarding stale outcome"
                );
                Recorded::Discarded
            }
            Err(e) => {
                // Left claimed; the stale-claim sweep redelivers it
                error!(job_id = %id, operation, error = %e, "Failed to record job outcome");
                Recorded::Discarded
            }
        }
    }

    async fn record(
        &self,
        job: &JobEntry,
        transition: Transition,
        operation: &'static str,
    ) -> Result<JobEntry, QueueError> {
        let (backend, id, attempt) = (&self.backend, job.id, job.attempts);
        self.config
            .transport
            .run(operation, move || backend.record_outcome(id, attempt, transition.clone()))
            .await
    }

    async fn persist(&self, id: JobId, output: &serde_json::Value) -> Result<(), QueueError> {
        let store = &self.store;
        self.config
            .transport
            .run("save", move || async move {
                store.save(id, output).await.map_err(QueueError::from)
            })
            .await
    }

    async fn acknowledge(&self, id: JobId) {
        let backend = &self.backend;
        if let Err(e) = self.config.transport.run("ack", move || backend.ack(id)).await {
            warn!(job_id = %id, error = %e, "Failed to acknowledge job");
        }
    }

    async fn requeue(&self, id: JobId, delay: Duration) {
        let backend = &self.backend;
        if let Err(e) = self
            .config
            .transport
            .run("requeue", move || backend.nack(id, true, delay))
            .await
        {
            // Left in flight; the stale-claim sweep puts it back
            error!(job_id = %id, error = %e, "Failed to requeue job");
        }
    }
}

async fn reap_stale(
    backend: Arc<dyn QueueBackend>,
    interval: Duration,
    visibility_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match backend.requeue_stale(visibility_timeout).await {
            Ok(0) => {}
            Ok(reclaimed) => info!(reclaimed, "Reclaimed stale job claims"),
            Err(e) => warn!(error = %e, "Stale claim sweep failed"),
        }
    }
}
