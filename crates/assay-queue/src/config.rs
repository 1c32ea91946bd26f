//! Queue configuration
//!
//! Defaults suit a single-instance deployment with the local backend.
//! Environment variables override them:
//!
//! | variable | meaning |
//! |----------|---------|
//! | `ASSAY_QUEUE_BACKEND` | `local` or `remote` |
//! | `ASSAY_REDIS_URL` / `REDIS_URL` | Redis endpoint (implies `remote`) |
//! | `ASSAY_QUEUE_PREFIX` | Redis key prefix |
//! | `ASSAY_QUEUE_FALLBACK` | fall back to local when Redis is unreachable |
//! | `ASSAY_WORKERS` | worker concurrency |
//! | `ASSAY_MAX_ATTEMPTS` | default attempts per job |
//! | `ASSAY_BACKOFF` | `constant` or `exponential` |
//! | `ASSAY_BACKOFF_BASE_MS`, `ASSAY_BACKOFF_MAX_MS` | backoff timing |
//! | `ASSAY_RETRY_PERMANENT` | retry permanent handler failures too |
//! | `ASSAY_POLL_TIMEOUT_MS` | dequeue wait per poll |
//! | `ASSAY_VISIBILITY_TIMEOUT_SECS` | remote claim lifetime before redelivery |
//! | `ASSAY_TERMINAL_TTL_SECS` | how long finished jobs stay in the queue cache |
//! | `ASSAY_TRANSPORT_RETRIES` | tries per backend call on transport errors |

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::backend::{BackendKind, QueueError};
use crate::job::DEFAULT_MAX_ATTEMPTS;
use crate::memory::DEFAULT_TERMINAL_TTL;
use crate::retry::{BackoffStrategy, RetryPolicy, TransportRetry};
use crate::worker::WorkerConfig;

/// Default Redis key prefix
pub const DEFAULT_KEY_PREFIX: &str = "assay:queue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: BackendKind,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    /// Use the local backend when the remote one cannot be reached at startup
    pub remote_fallback: bool,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub retry_permanent: bool,
    pub poll_timeout: Duration,
    pub visibility_timeout: Duration,
    pub reap_interval: Duration,
    pub terminal_ttl: Duration,
    pub transport_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            redis_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            remote_fallback: true,
            concurrency: 4,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffStrategy::default(),
            retry_permanent: false,
            poll_timeout: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(900),
            reap_interval: Duration::from_secs(30),
            terminal_ttl: DEFAULT_TERMINAL_TTL,
            transport_retries: TransportRetry::default().max_tries,
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or invalid values keep
    /// their defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.redis_url = read(&lookup, "ASSAY_REDIS_URL").or_else(|| read(&lookup, "REDIS_URL"));
        if config.redis_url.is_some() {
            config.backend = BackendKind::Remote;
        }
        if let Some(backend) = read_parsed(&lookup, "ASSAY_QUEUE_BACKEND") {
            config.backend = backend;
        }
        if let Some(prefix) = read(&lookup, "ASSAY_QUEUE_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(fallback) = read_flag(&lookup, "ASSAY_QUEUE_FALLBACK") {
            config.remote_fallback = fallback;
        }
        if let Some(workers) = read_parsed(&lookup, "ASSAY_WORKERS") {
            config.concurrency = workers;
        }
        if let Some(attempts) = read_parsed(&lookup, "ASSAY_MAX_ATTEMPTS") {
            config.max_attempts = attempts;
        }

        let base_ms: Option<u64> = read_parsed(&lookup, "ASSAY_BACKOFF_BASE_MS");
        let max_ms: Option<u64> = read_parsed(&lookup, "ASSAY_BACKOFF_MAX_MS");
        let strategy = read(&lookup, "ASSAY_BACKOFF").map(|v| v.to_ascii_lowercase());
        config.backoff = match strategy.as_deref() {
            Some("constant") => BackoffStrategy::Constant {
                delay_ms: base_ms.unwrap_or(1_000),
            },
            other => {
                if let Some(unknown) = other.filter(|v| *v != "exponential") {
                    warn!(
                        env_var = "ASSAY_BACKOFF",
                        value = %unknown,
                        "unknown backoff strategy; using exponential"
                    );
                }
                BackoffStrategy::Exponential {
                    initial_ms: base_ms.unwrap_or(1_000),
                    multiplier: 2.0,
                    max_ms: max_ms.unwrap_or(60_000),
                }
            }
        };

        if let Some(retry) = read_flag(&lookup, "ASSAY_RETRY_PERMANENT") {
            config.retry_permanent = retry;
        }
        if let Some(ms) = read_parsed(&lookup, "ASSAY_POLL_TIMEOUT_MS") {
            config.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = read_parsed(&lookup, "ASSAY_VISIBILITY_TIMEOUT_SECS") {
            config.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_parsed(&lookup, "ASSAY_TERMINAL_TTL_SECS") {
            config.terminal_ttl = Duration::from_secs(secs);
        }
        if let Some(tries) = read_parsed(&lookup, "ASSAY_TRANSPORT_RETRIES") {
            config.transport_retries = tries;
        }

        config
    }

    /// Reject settings the queue cannot run with
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.concurrency == 0 {
            return Err(QueueError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(QueueError::InvalidConfig("poll_timeout must be positive".into()));
        }
        if self.backend == BackendKind::Remote && self.redis_url.is_none() {
            return Err(QueueError::InvalidConfig(
                "remote backend requires a redis url".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: self.backoff,
            retry_permanent: self.retry_permanent,
        }
    }

    pub fn transport_retry(&self) -> TransportRetry {
        TransportRetry {
            max_tries: self.transport_retries.max(1),
            ..Default::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency,
            poll_timeout: self.poll_timeout,
            retry: self.retry_policy(),
            transport: self.transport_retry(),
            visibility_timeout: self.visibility_timeout,
            reap_interval: self.reap_interval,
        }
    }
}

fn read<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_parsed<F, T>(lookup: &F, name: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let raw = read(lookup, name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(env_var = name, value = %raw, error = %e, "invalid queue setting; using default");
            None
        }
    }
}

fn read_flag<F>(lookup: &F, name: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = read(lookup, name)?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(env_var = name, value = %raw, "invalid boolean queue setting; using default");
            None
        }
    }
}
