//! Redis backend tests.
//!
//! These need a live server: set `ASSAY_TEST_REDIS_URL` (e.g.
//! `redis://127.0.0.1:6379/15`). Without it every test returns early.
#![cfg(feature = "redis")]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use assay_queue::{
    JobEntry, JobStatus, QueueBackend, QueueError, RedisQueue, RedisQueueOptions, Transition,
};

const SHORT: Duration = Duration::from_millis(200);

fn test_queue() -> Option<RedisQueue> {
    let url = std::env::var("ASSAY_TEST_REDIS_URL").ok()?;
    let options = RedisQueueOptions {
        // Fresh namespace per test so runs never see each other's keys
        key_prefix: format!("assay:test:{}", Uuid::new_v4()),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    Some(RedisQueue::new(&url, options).expect("valid redis url"))
}

#[tokio::test]
async fn test_redis_enqueue_dequeue_ack() {
    let Some(queue) = test_queue() else { return };
    queue.health_check().await.unwrap();

    let job = JobEntry::new(json!({"file": "a.pdf"}), 3);
    let id = job.id;
    queue.enqueue(job).await.unwrap();

    let claimed = queue.dequeue(SHORT).await.unwrap().expect("job should be delivered");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.attempts, 1);
    assert!(queue.dequeue(SHORT).await.unwrap().is_none());

    queue
        .transition(id, Transition::Complete(json!({"ok": true})))
        .await
        .unwrap();
    queue.ack(id).await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_redis_fifo_and_cancel_skip() {
    let Some(queue) = test_queue() else { return };

    let first = JobEntry::new(json!({"n": 1}), 3);
    let second = JobEntry::new(json!({"n": 2}), 3);
    let third = JobEntry::new(json!({"n": 3}), 3);
    let (id1, id2, id3) = (first.id, second.id, third.id);
    for job in [first, second, third] {
        queue.enqueue(job).await.unwrap();
    }

    queue.transition(id2, Transition::Cancel).await.unwrap();

    assert_eq!(queue.dequeue(SHORT).await.unwrap().unwrap().id, id1);
    assert_eq!(queue.dequeue(SHORT).await.unwrap().unwrap().id, id3);
    assert!(queue.dequeue(SHORT).await.unwrap().is_none());

    let err = queue.transition(id2, Transition::Cancel).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidTransition {
            from: JobStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn test_redis_delayed_retry() {
    let Some(queue) = test_queue() else { return };

    let job = JobEntry::new(json!({}), 3);
    let id = job.id;
    queue.enqueue(job).await.unwrap();
    queue.dequeue(SHORT).await.unwrap().unwrap();

    let delay = Duration::from_millis(300);
    queue.transition(id, Transition::Retry { delay }).await.unwrap();
    queue.nack(id, true, delay).await.unwrap();

    assert!(queue.dequeue(Duration::from_millis(50)).await.unwrap().is_none());
    let again = queue
        .dequeue(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("delayed job should mature");
    assert_eq!(again.id, id);
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
async fn test_redis_requeue_stale_claims() {
    let Some(queue) = test_queue() else { return };

    let job = JobEntry::new(json!({}), 3);
    let id = job.id;
    queue.enqueue(job).await.unwrap();
    queue.dequeue(SHORT).await.unwrap().unwrap();

    // Fresh claims are left alone
    assert_eq!(queue.requeue_stale(Duration::from_secs(60)).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.requeue_stale(Duration::from_millis(10)).await.unwrap(), 1);
    assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Pending);

    let redelivered = queue.dequeue(SHORT).await.unwrap().unwrap();
    assert_eq!(redelivered.id, id);
    assert_eq!(redelivered.attempts, 2);
}

#[tokio::test]
async fn test_redis_requeue_lost_after_retry_is_recovered() {
    let Some(queue) = test_queue() else { return };

    let job = JobEntry::new(json!({}), 3);
    let id = job.id;
    queue.enqueue(job).await.unwrap();
    let claimed = queue.dequeue(SHORT).await.unwrap().unwrap();

    // Retry recorded, but the requeue never reached the broker
    queue
        .record_outcome(id, claimed.attempts, Transition::Retry { delay: Duration::ZERO })
        .await
        .unwrap();
    assert!(queue.dequeue(Duration::from_millis(50)).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.requeue_stale(Duration::from_millis(10)).await.unwrap(), 1);

    let redelivered = queue.dequeue(SHORT).await.unwrap().expect("orphaned job is redelivered");
    assert_eq!(redelivered.id, id);
    assert_eq!(redelivered.attempts, 2);
    assert_eq!(queue.stats().await.unwrap().running, 1);
}

#[tokio::test]
async fn test_redis_stale_outcome_is_refused() {
    let Some(queue) = test_queue() else { return };

    let job = JobEntry::new(json!({}), 3);
    let id = job.id;
    queue.enqueue(job).await.unwrap();
    let first = queue.dequeue(SHORT).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.requeue_stale(Duration::from_millis(10)).await.unwrap(), 1);
    let second = queue.dequeue(SHORT).await.unwrap().unwrap();

    let err = queue
        .record_outcome(id, first.attempts, Transition::Complete(json!("late")))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::StaleClaim { attempt: 1, .. }));

    let done = queue
        .record_outcome(id, second.attempts, Transition::Complete(json!("fresh")))
        .await
        .unwrap();
    assert_eq!(done.result, Some(json!("fresh")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_concurrent_dequeue_delivers_once() {
    let Some(queue) = test_queue() else { return };
    let queue = Arc::new(queue);

    for i in 0..20 {
        queue.enqueue(JobEntry::new(json!({ "n": i }), 1)).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(job) = queue.dequeue(SHORT).await.unwrap() {
                seen.push(job.id);
            }
            seen
        }));
    }

    let mut delivered = Vec::new();
    for task in tasks {
        delivered.extend(task.await.unwrap());
    }
    let unique: std::collections::HashSet<_> = delivered.iter().collect();
    assert_eq!(delivered.len(), 20);
    assert_eq!(unique.len(), 20);
}
