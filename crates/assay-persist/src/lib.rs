//! # Assay Persistence
//!
//! Durable `ResultStore` implementations for the job queue.
//!
//! Supports:
//! - SQLite (single node, or `sqlite::memory:` for tests)

pub mod sqlite;

pub use sqlite::{SqliteResultStore, SqliteStoreConfig};
