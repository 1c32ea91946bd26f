//! SQLite result store implementation

use assay_queue::{JobId, ResultStore, StoreError};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_results (
    job_id TEXT PRIMARY KEY,
    output TEXT NOT NULL,
    saved_at TEXT NOT NULL
)
"#;

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Database URL (e.g., "sqlite:assay.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:assay.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteStoreConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// Job outputs keyed by job id, one row per job
#[derive(Debug, Clone)]
pub struct SqliteResultStore {
    pool: SqlitePool,
}

impl SqliteResultStore {
    /// Open (creating if needed) the database at `url` with default settings
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let config = SqliteStoreConfig {
            url: url.to_string(),
            ..Default::default()
        };
        Self::connect_with_config(config).await
    }

    pub async fn connect_with_config(config: SqliteStoreConfig) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        options = options.pragma("busy_timeout", (config.busy_timeout_secs * 1000).to_string());
        if config.wal_mode && !config.is_memory() {
            options = options.pragma("journal_mode", "WAL");
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_memory() {
            // Every connection to :memory: is its own database; keep the one alive
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite result store");
        Self::new(pool).await
    }

    /// Use an existing pool, creating the results table if missing
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Query(format!("schema setup failed: {}", e)))?;
        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn is_healthy(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Number of stored results
    pub async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM job_results")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save(&self, id: JobId, output: &serde_json::Value) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(output).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();

        // A retried job may save twice; the latest output wins
        sqlx::query(
            "INSERT INTO job_results (job_id, output, saved_at) VALUES (?, ?, ?)
             ON CONFLICT(job_id) DO UPDATE
             SET output = excluded.output, saved_at = excluded.saved_at",
        )
        .bind(id.to_string())
        .bind(json)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        debug!(job_id = %id, "Saved job result");
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query("SELECT output FROM job_results WHERE job_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let raw: String = row
                    .try_get("output")
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}
