//! Retry policy for failed attempts and transport-level retries

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::QueueError;
use crate::handler::HandlerError;
use crate::job::JobEntry;

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 1_000,
            multiplier: 2.0,
            max_ms: 60_000,
        }
    }
}

impl BackoffStrategy {
    /// Delay before redelivery, `attempt` counted from zero
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                // float-to-int casts saturate, so overflow lands on the cap
                let ms = (*initial_ms as f64 * multiplier.powi(exponent)) as u64;
                Duration::from_millis(ms.min(*max_ms))
            }
        }
    }
}

/// What to do with a job whose attempt just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back in the queue, eligible after the delay
    Retry(Duration),
    /// Mark it failed
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryPolicy {
    pub backoff: BackoffStrategy,
    /// Spend remaining attempts on `Permanent` failures too
    pub retry_permanent: bool,
}

impl RetryPolicy {
    pub fn decide(&self, job: &JobEntry, error: &HandlerError) -> RetryDecision {
        if !error.is_retryable() && !self.retry_permanent {
            return RetryDecision::GiveUp;
        }
        if job.attempts < job.max_attempts {
            RetryDecision::Retry(self.backoff.delay(job.attempts.saturating_sub(1)))
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Bounded retries for transient failures (see [`QueueError::is_transient`]).
///
/// These never count against a job's attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRetry {
    /// Total tries, including the first
    pub max_tries: u32,
    pub base_delay: Duration,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            max_tries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl TransportRetry {
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let tries = self.max_tries.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Queue operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < tries => {
                    let delay = self.base_delay * 2_u32.saturating_pow(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
