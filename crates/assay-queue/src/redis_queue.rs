//! Redis-backed queue (the remote backend)
//!
//! Key layout under the configured prefix:
//! - `{prefix}:job:{id}`   JSON job record
//! - `{prefix}:pending`    list of ids ready for delivery (FIFO)
//! - `{prefix}:processing` list of ids claimed by a worker
//! - `{prefix}:delayed`    sorted set of ids waiting out a retry backoff,
//!                         scored by the unix millisecond they become ready
//! - `{prefix}:stats`      hash of terminal-state counters
//!
//! Record updates go through a compare-and-set script, so every instance
//! sees the same state machine. Requires Redis 6.2+ (`LMOVE`).

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, RedisError, RedisResult, Script};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendKind, QueueBackend, QueueError, QueueStats};
use crate::config::DEFAULT_KEY_PREFIX;
use crate::job::{JobEntry, JobId, JobStatus, Transition};
use crate::memory::DEFAULT_TERMINAL_TTL;

/// Optimistic update attempts before giving up on a contended record
const CAS_RETRIES: usize = 8;

/// Max delayed entries promoted per dequeue pass
const PROMOTE_BATCH: usize = 100;

const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
if tonumber(ARGV[3]) > 0 then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
else
  redis.call('SET', KEYS[1], ARGV[2])
end
return 1
"#;

const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return #ids
"#;

#[derive(Debug, Clone)]
pub struct RedisQueueOptions {
    pub key_prefix: String,
    /// Finished records expire after this long
    pub terminal_ttl: Duration,
    /// Pause between empty polls inside `dequeue`
    pub poll_interval: Duration,
}

impl Default for RedisQueueOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            terminal_ttl: DEFAULT_TERMINAL_TTL,
            poll_interval: Duration::from_millis(100),
        }
    }
}

fn map_redis_error(err: RedisError) -> QueueError {
    let transport = err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout();
    if transport {
        QueueError::BackendUnavailable(err.to_string())
    } else {
        QueueError::Backend(err.to_string())
    }
}

pub struct RedisQueue {
    client: redis::Client,
    options: RedisQueueOptions,
    connection: Mutex<Option<MultiplexedConnection>>,
    cas: Script,
    promote: Script,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("key_prefix", &self.options.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Create a client for `url`. No connection is opened until first use.
    pub fn new(url: &str, options: RedisQueueOptions) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::InvalidConfig(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            options,
            connection: Mutex::new(None),
            cas: Script::new(CAS_SCRIPT),
            promote: Script::new(PROMOTE_SCRIPT),
        })
    }

    pub fn key_prefix(&self) -> &str {
        &self.options.key_prefix
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.options.key_prefix, id)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.options.key_prefix)
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.options.key_prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.options.key_prefix)
    }

    fn stats_key(&self) -> String {
        format!("{}:stats", self.options.key_prefix)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        debug!(key_prefix = %self.options.key_prefix, "Redis queue connected");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Map a command result, dropping the cached connection on transport errors
    async fn check<T>(&self, result: RedisResult<T>) -> Result<T, QueueError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = map_redis_error(e);
                if err.is_transient() {
                    *self.connection.lock().await = None;
                }
                Err(err)
            }
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, QueueError> {
        let mut conn = self.connection().await?;
        let result = cmd.query_async(&mut conn).await;
        self.check(result).await
    }

    async fn query_pipe<T: FromRedisValue>(&self, pipe: &redis::Pipeline) -> Result<T, QueueError> {
        let mut conn = self.connection().await?;
        let result = pipe.query_async(&mut conn).await;
        self.check(result).await
    }

    async fn invoke<T: FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T, QueueError> {
        let mut conn = self.connection().await?;
        let result = invocation.invoke_async(&mut conn).await;
        self.check(result).await
    }

    async fn load(&self, id: JobId) -> Result<Option<(String, JobEntry)>, QueueError> {
        let raw: Option<String> = self.query(redis::cmd("GET").arg(self.job_key(id))).await?;
        match raw {
            Some(raw) => {
                let job = serde_json::from_str(&raw)?;
                Ok(Some((raw, job)))
            }
            None => Ok(None),
        }
    }

    /// Read-modify-write a record with optimistic concurrency
    async fn update<F>(&self, id: JobId, mut apply: F) -> Result<JobEntry, QueueError>
    where
        F: FnMut(&mut JobEntry) -> Result<(), QueueError> + Send,
    {
        let key = self.job_key(id);
        for _ in 0..CAS_RETRIES {
            let (raw, mut job) = self.load(id).await?.ok_or(QueueError::NotFound)?;
            let was_terminal = job.is_terminal();
            apply(&mut job)?;

            let ttl_ms = if job.is_terminal() {
                self.options.terminal_ttl.as_millis() as u64
            } else {
                0
            };
            let next = serde_json::to_string(&job)?;

            let mut invocation = self.cas.prepare_invoke();
            invocation.key(&key).arg(&raw).arg(&next).arg(ttl_ms);
            let swapped: i64 = self.invoke(&invocation).await?;

            if swapped == 1 {
                if job.is_terminal() && !was_terminal {
                    let counted: RedisResult<i64> = {
                        let mut conn = self.connection().await?;
                        redis::cmd("HINCRBY")
                            .arg(self.stats_key())
                            .arg(job.status.as_str())
                            .arg(1)
                            .query_async(&mut conn)
                            .await
                    };
                    if let Err(e) = counted {
                        warn!(job_id = %id, error = %e, "Failed to update queue counters");
                    }
                }
                return Ok(job);
            }
            debug!(job_id = %id, "Concurrent job update, retrying");
        }
        Err(QueueError::Backend(format!("job {} is contended", id)))
    }

    async fn promote_due(&self) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut invocation = self.promote.prepare_invoke();
        invocation
            .key(self.delayed_key())
            .key(self.pending_key())
            .arg(now_ms)
            .arg(PROMOTE_BATCH);
        let promoted: i64 = self.invoke(&invocation).await?;
        if promoted > 0 {
            debug!(promoted, "Promoted delayed jobs");
        }
        Ok(())
    }

    async fn forget_processing(&self, id: &str) -> Result<(), QueueError> {
        self.query::<i64>(redis::cmd("LREM").arg(self.processing_key()).arg(1).arg(id))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn enqueue(&self, job: JobEntry) -> Result<(), QueueError> {
        let record = serde_json::to_string(&job)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(self.job_key(job.id))
            .arg(record)
            .ignore()
            .cmd("LPUSH")
            .arg(self.pending_key())
            .arg(job.id.to_string())
            .ignore();
        self.query_pipe::<()>(&pipe).await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobEntry>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.promote_due().await?;

            let claimed: Option<String> = self
                .query(
                    redis::cmd("LMOVE")
                        .arg(self.pending_key())
                        .arg(self.processing_key())
                        .arg("RIGHT")
                        .arg("LEFT"),
                )
                .await?;

            if let Some(raw_id) = claimed {
                let Ok(id) = Uuid::parse_str(&raw_id) else {
                    warn!(raw_id = %raw_id, "Dropping malformed job id from queue");
                    self.forget_processing(&raw_id).await?;
                    continue;
                };

                let started = self
                    .update(id, |job| match job.transition(Transition::Start) {
                        Err(e) if job.status == JobStatus::Pending => {
                            warn!(
                                job_id = %job.id,
                                error = %e,
                                "Pending job could not start, marking failed"
                            );
                            job.transition(Transition::Fail("attempt limit reached".to_string()))
                        }
                        other => other,
                    })
                    .await;

                match started {
                    Ok(job) if job.status == JobStatus::Running => return Ok(Some(job)),
                    Ok(_)
                    | Err(QueueError::InvalidTransition { .. })
                    | Err(QueueError::NotFound) => {
                        // Cancelled, exhausted, expired, or a duplicate entry
                        self.forget_processing(&raw_id).await?;
                        continue;
                    }
                    // Left in processing; the stale-claim sweep recovers it
                    Err(e) => return Err(e),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.options.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, id: JobId) -> Result<(), QueueError> {
        self.forget_processing(&id.to_string()).await
    }

    async fn nack(&self, id: JobId, requeue: bool, delay: Duration) -> Result<(), QueueError> {
        let member = id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(self.processing_key())
            .arg(1)
            .arg(&member)
            .ignore();

        if requeue {
            if delay.is_zero() {
                pipe.cmd("LPUSH").arg(self.pending_key()).arg(&member).ignore();
            } else {
                let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                pipe.cmd("ZADD")
                    .arg(self.delayed_key())
                    .arg(ready_at)
                    .arg(&member)
                    .ignore();
            }
        }
        self.query_pipe::<()>(&pipe).await
    }

    async fn transition(&self, id: JobId, transition: Transition) -> Result<JobEntry, QueueError> {
        let cancelling = matches!(transition, Transition::Cancel);
        let job = self
            .update(id, |job| job.transition(transition.clone()))
            .await?;

        if cancelling {
            // Dequeue skips cancelled ids anyway; this just keeps the lists tidy
            let member = id.to_string();
            let mut pipe = redis::pipe();
            pipe.cmd("LREM")
                .arg(self.pending_key())
                .arg(0)
                .arg(&member)
                .ignore()
                .cmd("ZREM")
                .arg(self.delayed_key())
                .arg(&member)
                .ignore();
            if let Err(e) = self.query_pipe::<()>(&pipe).await {
                debug!(job_id = %id, error = %e, "Failed to drop cancelled job from queue lists");
            }
        }
        Ok(job)
    }

    async fn record_outcome(
        &self,
        id: JobId,
        attempt: u32,
        transition: Transition,
    ) -> Result<JobEntry, QueueError> {
        self.update(id, |job| job.transition_claim(attempt, transition.clone()))
            .await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobEntry>, QueueError> {
        Ok(self.load(id).await?.map(|(_, job)| job))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut pipe = redis::pipe();
        pipe.cmd("LLEN")
            .arg(self.pending_key())
            .cmd("ZCARD")
            .arg(self.delayed_key())
            .cmd("LLEN")
            .arg(self.processing_key())
            .cmd("HMGET")
            .arg(self.stats_key())
            .arg(JobStatus::Completed.as_str())
            .arg(JobStatus::Failed.as_str())
            .arg(JobStatus::Cancelled.as_str());

        let (pending, delayed, running, counters): (u64, u64, u64, Vec<Option<u64>>) =
            self.query_pipe(&pipe).await?;
        let counter = |i: usize| counters.get(i).copied().flatten().unwrap_or(0);

        Ok(QueueStats {
            backend: BackendKind::Remote,
            pending: pending + delayed,
            running,
            completed: counter(0),
            failed: counter(1),
            cancelled: counter(2),
        })
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let pong: String = self.query(&redis::cmd("PING")).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(QueueError::Backend(format!("unexpected PING reply: {}", pong)))
        }
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let claimed: Vec<String> = self
            .query(redis::cmd("LRANGE").arg(self.processing_key()).arg(0).arg(-1))
            .await?;

        let mut requeued = 0;
        for raw_id in claimed {
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                self.forget_processing(&raw_id).await?;
                continue;
            };
            let Some((_, job)) = self.load(id).await? else {
                self.forget_processing(&raw_id).await?;
                continue;
            };
            if job.updated_at >= cutoff {
                continue;
            }

            let reclaimed = match job.status {
                JobStatus::Running => {
                    self.update(id, |job| {
                        // Re-checked under CAS: the worker may have reported meanwhile
                        if job.status != JobStatus::Running || job.updated_at >= cutoff {
                            return Err(QueueError::InvalidTransition {
                                from: job.status,
                                to: JobStatus::Pending,
                            });
                        }
                        if job.attempts < job.max_attempts {
                            job.transition(Transition::Retry {
                                delay: Duration::ZERO,
                            })
                        } else {
                            job.transition(Transition::Fail(
                                "worker stopped before reporting an outcome".to_string(),
                            ))
                        }
                    })
                    .await
                }
                // Claim abandoned before it started, or a requeue that never landed
                JobStatus::Pending => Ok(job),
                // Outcome recorded but never acked
                _ => {
                    self.forget_processing(&raw_id).await?;
                    continue;
                }
            };

            match reclaimed {
                Ok(job) => {
                    let requeue = job.status == JobStatus::Pending;
                    let delay = (job.run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    self.nack(id, requeue, delay).await?;
                    info!(job_id = %id, status = %job.status, "Reclaimed stale job");
                    requeued += 1;
                }
                Err(QueueError::NotFound) => self.forget_processing(&raw_id).await?,
                // Reported while the sweep was looking
                Err(QueueError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }
}
