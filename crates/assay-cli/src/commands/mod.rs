//! CLI command implementations

pub mod info;
pub mod jobs;
pub mod work;

use anyhow::{Context, Result};
use std::sync::Arc;

use assay_persist::SqliteResultStore;
use assay_queue::{QueueConfig, QueueManager};

/// Open the result store shared by workers and front ends
pub async fn open_store(db: &str) -> Result<Arc<SqliteResultStore>> {
    let store = SqliteResultStore::connect(db)
        .await
        .with_context(|| format!("failed to open result store at {}", db))?;
    Ok(Arc::new(store))
}

/// A worker-less manager for commands that only read or change job state
pub async fn producer(db: &str) -> Result<QueueManager> {
    let store = open_store(db).await?;
    QueueManager::producer(QueueConfig::from_env(), store)
        .await
        .context("failed to connect to queue backend")
}
