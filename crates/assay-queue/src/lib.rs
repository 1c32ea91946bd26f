//! # Assay Queue
//!
//! Async background job queue for document-analysis work.
//!
//! Features:
//! - Job lifecycle state machine (`pending -> running -> completed|failed`,
//!   with retry and cancellation edges)
//! - Pluggable backend: in-process (`MemoryQueue`) or Redis (`RedisQueue`)
//! - Worker pool with bounded concurrency and graceful drain
//! - Retry with constant or exponential backoff
//! - `QueueManager` facade for enqueue / status / cancel

pub mod backend;
pub mod config;
pub mod handler;
pub mod job;
pub mod manager;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod retry;
pub mod worker;

pub use backend::{BackendKind, QueueBackend, QueueError, QueueStats};
pub use config::QueueConfig;
pub use handler::{HandlerError, JobHandler, MemoryResultStore, ResultStore, StoreError};
pub use job::{JobEntry, JobId, JobSnapshot, JobStatus, Transition};
pub use manager::{connect_backend, QueueHealth, QueueManager};
pub use memory::MemoryQueue;
#[cfg(feature = "redis")]
pub use redis_queue::{RedisQueue, RedisQueueOptions};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy, TransportRetry};
pub use worker::{WorkerConfig, WorkerPool};
