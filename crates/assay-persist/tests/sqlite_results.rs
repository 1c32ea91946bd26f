use std::sync::Arc;
use std::time::Duration;

use assay_persist::{SqliteResultStore, SqliteStoreConfig};
use assay_queue::{
    BackoffStrategy, HandlerError, JobHandler, JobStatus, MemoryQueue, QueueConfig, QueueManager,
    ResultStore,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn memory_store() -> Result<SqliteResultStore, assay_queue::StoreError> {
    SqliteResultStore::connect_with_config(SqliteStoreConfig::memory()).await
}

#[tokio::test]
async fn test_save_load_and_overwrite() -> TestResult {
    let store = memory_store().await?;
    let id = Uuid::new_v4();

    assert!(store.load(id).await?.is_none());

    store.save(id, &json!({"summary": "normal ranges"})).await?;
    assert_eq!(store.load(id).await?, Some(json!({"summary": "normal ranges"})));

    // Saving again for the same job replaces the row
    store.save(id, &json!({"summary": "revised"})).await?;
    assert_eq!(store.load(id).await?, Some(json!({"summary": "revised"})));
    assert_eq!(store.count().await?, 1);
    assert!(store.is_healthy().await);

    Ok(())
}

#[tokio::test]
async fn test_existing_pool_gets_schema() -> TestResult {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let store = SqliteResultStore::new(pool.clone()).await?;
    // Creating the table twice is harmless
    let again = SqliteResultStore::new(pool).await?;

    let id = Uuid::new_v4();
    store.save(id, &json!([1, 2, 3])).await?;
    assert_eq!(again.load(id).await?, Some(json!([1, 2, 3])));

    Ok(())
}

struct Summarize;

#[async_trait]
impl JobHandler for Summarize {
    async fn execute(&self, payload: &Value) -> Result<Value, HandlerError> {
        let pages = payload["pages"]
            .as_u64()
            .ok_or_else(|| HandlerError::Permanent("missing page count".into()))?;
        Ok(json!({ "pages": pages, "summary": "ok" }))
    }
}

#[tokio::test]
async fn test_status_reads_store_after_queue_eviction() -> TestResult {
    let store = Arc::new(memory_store().await?);
    // Finished jobs leave the queue almost immediately
    let queue = Arc::new(MemoryQueue::with_terminal_ttl(Duration::from_millis(1)));
    let config = QueueConfig {
        concurrency: 1,
        poll_timeout: Duration::from_millis(20),
        backoff: BackoffStrategy::Constant { delay_ms: 1 },
        ..Default::default()
    };
    let manager = QueueManager::with_backend(queue, Arc::new(Summarize), store.clone(), &config)?;

    let id = manager.enqueue(json!({"pages": 7}), None).await?;

    let mut status = None;
    for _ in 0..200 {
        let snapshot = manager.status(id).await?;
        if snapshot.status.is_terminal() {
            status = Some(snapshot.status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, Some(JobStatus::Completed));
    // The output is saved right after completion is recorded
    for _ in 0..200 {
        if store.load(id).await?.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The next enqueue prunes the finished record from the queue
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.enqueue(json!({"pages": 1}), None).await?;

    let snapshot = manager.status(id).await?;
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert!(snapshot.attempts.is_none(), "served from the result store");
    assert_eq!(snapshot.result, Some(json!({"pages": 7, "summary": "ok"})));

    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_snapshot_from_store_is_completed() -> TestResult {
    let store = Arc::new(memory_store().await?);
    let producer = QueueManager::producer_with_backend(
        Arc::new(MemoryQueue::new()),
        store.clone(),
        &QueueConfig::default(),
    )?;

    let id = Uuid::new_v4();
    store.save(id, &json!({"pages": 2})).await?;

    let snapshot = producer.status(id).await?;
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.result, Some(json!({"pages": 2})));
    assert!(snapshot.attempts.is_none());

    Ok(())
}
