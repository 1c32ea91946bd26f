//! Queue manager: the entry point front ends talk to

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendKind, QueueBackend, QueueError, QueueStats};
use crate::config::QueueConfig;
use crate::handler::{JobHandler, ResultStore};
use crate::job::{JobEntry, JobId, JobSnapshot, JobStatus, Transition};
use crate::memory::MemoryQueue;
use crate::retry::TransportRetry;
use crate::worker::WorkerPool;

/// Result of a backend health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub backend: BackendKind,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Owns the backend and the worker pool.
///
/// Workers start on construction. Call [`QueueManager::shutdown`] to drain
/// them; dropping the manager only signals the workers to stop.
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    store: Arc<dyn ResultStore>,
    max_attempts: u32,
    transport: TransportRetry,
    pool: Option<WorkerPool>,
    shutdown: CancellationToken,
}

impl QueueManager {
    /// Validate `config`, connect the configured backend and start workers
    pub async fn start(
        config: QueueConfig,
        handler: Arc<dyn JobHandler>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let backend = connect_backend(&config).await?;
        Self::with_backend(backend, handler, store, &config)
    }

    /// Start workers on a caller-built backend
    pub fn with_backend(
        backend: Arc<dyn QueueBackend>,
        handler: Arc<dyn JobHandler>,
        store: Arc<dyn ResultStore>,
        config: &QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(
            backend.clone(),
            handler,
            store.clone(),
            config.worker_config(),
            shutdown.clone(),
        );
        Ok(Self {
            backend,
            store,
            max_attempts: config.max_attempts,
            transport: config.transport_retry(),
            pool: Some(pool),
            shutdown,
        })
    }

    /// A manager without workers, for processes that only enqueue and poll
    pub async fn producer(
        config: QueueConfig,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let backend = connect_backend(&config).await?;
        Self::producer_with_backend(backend, store, &config)
    }

    pub fn producer_with_backend(
        backend: Arc<dyn QueueBackend>,
        store: Arc<dyn ResultStore>,
        config: &QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            backend,
            store,
            max_attempts: config.max_attempts,
            transport: config.transport_retry(),
            pool: None,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Number of running executors (zero for a producer)
    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(0, WorkerPool::size)
    }

    /// Queue `payload` as a new pending job.
    ///
    /// `max_attempts` defaults to the configured value.
    pub async fn enqueue(
        &self,
        payload: serde_json::Value,
        max_attempts: Option<u32>,
    ) -> Result<JobId, QueueError> {
        let max_attempts = max_attempts.unwrap_or(self.max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::InvalidConfig("max_attempts must be at least 1".into()));
        }

        let job = JobEntry::new(payload, max_attempts);
        let id = job.id;
        let backend = &self.backend;
        self.transport
            .run("enqueue", move || backend.enqueue(job.clone()))
            .await?;

        info!(job_id = %id, max_attempts, "Job enqueued");
        Ok(id)
    }

    /// Current lifecycle snapshot.
    ///
    /// Falls back to the result store once the backend has evicted the job.
    /// The store only holds outputs of completed jobs, so a failed or
    /// cancelled job reports `NotFound` after its record expires
    /// (`terminal_ttl`).
    pub async fn status(&self, id: JobId) -> Result<JobSnapshot, QueueError> {
        let backend = &self.backend;
        if let Some(job) = self.transport.run("status", move || backend.get(id)).await? {
            return Ok(job.snapshot());
        }
        match self.store.load(id).await? {
            Some(output) => Ok(JobSnapshot::from_stored(id, output)),
            None => Err(QueueError::NotFound),
        }
    }

    /// Cancel a pending or running job.
    ///
    /// A running handler is not interrupted; its outcome is discarded.
    pub async fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        let backend = &self.backend;
        let cancelled = self
            .transport
            .run("cancel", move || backend.transition(id, Transition::Cancel))
            .await;

        match cancelled {
            Ok(_) => {
                info!(job_id = %id, "Job cancelled");
                Ok(())
            }
            Err(QueueError::InvalidTransition { from, .. }) => Err(QueueError::CannotCancel(from)),
            Err(QueueError::NotFound) => match self.store.load(id).await? {
                Some(_) => Err(QueueError::CannotCancel(JobStatus::Completed)),
                None => Err(QueueError::NotFound),
            },
            Err(e) => Err(e),
        }
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.backend.stats().await
    }

    pub async fn health(&self) -> QueueHealth {
        let result = self.backend.health_check().await;
        QueueHealth {
            backend: self.backend.kind(),
            healthy: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Stop the workers and wait for in-flight jobs to finish
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(pool) = self.pool.take() {
            pool.join().await;
        }
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if self.pool.is_some() {
            warn!("QueueManager dropped without shutdown; workers stop after their current job");
        }
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("backend", &self.backend.kind())
            .field("workers", &self.workers())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Build the backend `config` asks for.
///
/// An unreachable Redis falls back to the local queue when
/// `remote_fallback` is set.
pub async fn connect_backend(config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, QueueError> {
    match config.backend {
        BackendKind::Local => {
            info!("Using local queue backend");
            Ok(local_backend(config))
        }
        BackendKind::Remote => connect_remote(config).await,
    }
}

fn local_backend(config: &QueueConfig) -> Arc<dyn QueueBackend> {
    Arc::new(MemoryQueue::with_terminal_ttl(config.terminal_ttl))
}

#[cfg(feature = "redis")]
async fn connect_remote(config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, QueueError> {
    use crate::redis_queue::{RedisQueue, RedisQueueOptions};

    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| QueueError::InvalidConfig("remote backend requires a redis url".into()))?;
    let queue = RedisQueue::new(
        url,
        RedisQueueOptions {
            key_prefix: config.key_prefix.clone(),
            terminal_ttl: config.terminal_ttl,
            ..Default::default()
        },
    )?;

    let target = &queue;
    match config
        .transport_retry()
        .run("connect", move || target.health_check())
        .await
    {
        Ok(()) => {
            info!(key_prefix = %queue.key_prefix(), "Using Redis queue backend");
            Ok(Arc::new(queue))
        }
        Err(e) if config.remote_fallback => {
            warn!(error = %e, "Redis unavailable, falling back to local queue");
            Ok(local_backend(config))
        }
        Err(e) => Err(e),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_remote(config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, QueueError> {
    if config.remote_fallback {
        warn!("Built without redis support, falling back to local queue");
        return Ok(local_backend(config));
    }
    Err(QueueError::InvalidConfig("built without redis support".into()))
}
