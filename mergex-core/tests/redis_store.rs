//! Redis-backed store tests. These need a running Redis and are ignored by
//! default; point `REDIS_URL` at a disposable instance and run with
//! `cargo test -- --ignored`.

use mergex_core::model::{RepoKey, WorkItem};
use mergex_core::queue::{EnqueueOutcome, LeaseStatus, QueueStore, RedisQueueStore};
use mergex_core::Metrics;
use std::sync::Arc;
use std::time::Duration;

async fn store(namespace: &str) -> RedisQueueStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisQueueStore::connect(&url, namespace, Arc::new(Metrics::new().unwrap()))
        .await
        .expect("redis connection")
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn enqueue_pop_complete_cycle() {
    let store = store("mergex-test-cycle").await;
    let item = WorkItem::new(90, "octo", "cycle", 1);
    let repo = item.repo_key();

    assert_eq!(store.enqueue(&item).await.unwrap(), EnqueueOutcome::Enqueued);
    assert_eq!(store.enqueue(&item).await.unwrap(), EnqueueOutcome::Deduped);
    assert_eq!(store.queue_depth(&repo).await.unwrap(), 1);

    let popped = store.pop_head(&repo).await.unwrap().unwrap();
    assert_eq!(popped.dedup_key(), item.dedup_key());
    // Still deduped while in flight, and redelivered if popped again.
    assert_eq!(store.enqueue(&item).await.unwrap(), EnqueueOutcome::Deduped);
    let redelivered = store.pop_head(&repo).await.unwrap().unwrap();
    assert_eq!(redelivered.dedup_key(), item.dedup_key());

    store.complete(&popped).await.unwrap();
    assert!(store.pop_head(&repo).await.unwrap().is_none());
    assert_eq!(store.enqueue(&item).await.unwrap(), EnqueueOutcome::Enqueued);
    let cleanup = store.pop_head(&repo).await.unwrap().unwrap();
    store.complete(&cleanup).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn lease_tokens_are_exclusive_and_guarded() {
    let store = store("mergex-test-lease").await;
    let repo = RepoKey::new(91, "octo", "lease");
    let ttl = Duration::from_secs(5);

    let token = store.acquire_lease(&repo, ttl).await.unwrap().unwrap();
    assert!(store.acquire_lease(&repo, ttl).await.unwrap().is_none());
    assert_eq!(
        store.refresh_lease(&repo, &token, ttl).await.unwrap(),
        LeaseStatus::Held
    );

    store.release_lease(&repo, &token).await.unwrap();
    assert_eq!(
        store.refresh_lease(&repo, &token, ttl).await.unwrap(),
        LeaseStatus::Lost
    );
    let second = store.acquire_lease(&repo, ttl).await.unwrap().unwrap();
    store.release_lease(&repo, &second).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn dlq_push_clears_dedup_and_replays() {
    let store = store("mergex-test-dlq").await;
    let item = WorkItem::new(92, "octo", "dlq", 1);
    let repo = item.repo_key();

    store.enqueue(&item).await.unwrap();
    let popped = store.pop_head(&repo).await.unwrap().unwrap();
    store.push_dlq(&popped, "checks_timeout").await.unwrap();

    let entries = store.dlq_entries(&repo).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "checks_timeout");

    assert_eq!(store.replay_dlq(&repo).await.unwrap(), 1);
    let replayed = store.pop_head(&repo).await.unwrap().unwrap();
    assert_eq!(replayed.attempt, 0);
    store.complete(&replayed).await.unwrap();
}
