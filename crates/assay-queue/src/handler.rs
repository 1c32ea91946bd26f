//! Collaborator interfaces: the job handler and the result store

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::job::JobId;

/// Failure reported by a job handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth another attempt (timeouts, upstream outages)
    #[error("retryable failure: {0}")]
    Retryable(String),
    /// Will fail the same way every time (bad input)
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

/// Executes the work described by a job payload.
///
/// Invoked concurrently for distinct jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, payload: &serde_json::Value) -> Result<serde_json::Value, HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Durable home of job outputs once a job has completed
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, id: JobId, output: &serde_json::Value) -> Result<(), StoreError>;

    async fn load(&self, id: JobId) -> Result<Option<serde_json::Value>, StoreError>;
}

/// In-memory result store (for tests and single-process deployments)
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: RwLock<HashMap<JobId, serde_json::Value>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, id: JobId, output: &serde_json::Value) -> Result<(), StoreError> {
        self.results.write().await.insert(id, output.clone());
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.results.read().await.get(&id).cloned())
    }
}
