//! In-process queue store.
//!
//! Mirrors the Redis store's semantics over plain maps, including the
//! in-flight slot and TTL leases (measured on the tokio clock so paused-time
//! tests can exercise expiry). Backs the test suite and `--dev` runs.

use super::{DlqEntry, EnqueueOutcome, LeaseStatus, LeaseToken, QueueError, QueueStore};
use crate::metrics::Metrics;
use crate::model::{RepoKey, WorkItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Default)]
struct RepoState {
    pending: VecDeque<WorkItem>,
    processing: Option<WorkItem>,
    dedup: HashSet<String>,
    dlq: Vec<DlqEntry>,
    lease: Option<(String, Instant)>,
}

#[derive(Default)]
struct State {
    repos: HashMap<RepoKey, RepoState>,
    throttles: HashMap<u64, DateTime<Utc>>,
}

pub struct MemoryQueueStore {
    state: Mutex<State>,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for MemoryQueueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueueStore").finish()
    }
}

impl MemoryQueueStore {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            metrics,
        }
    }

    fn record_depth(&self, repo: &RepoKey, depth: usize) {
        self.metrics
            .queue_depth
            .with_label_values(&[&repo.to_string()])
            .set(depth as i64);
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, item: &WorkItem) -> Result<EnqueueOutcome, QueueError> {
        let repo = item.repo_key();
        let mut state = self.state.lock();
        let entry = state.repos.entry(repo.clone()).or_default();
        if entry.dedup.contains(&item.dedup_key()) {
            debug!("deduped {item}");
            let depth = entry.pending.len();
            drop(state);
            self.record_depth(&repo, depth);
            return Ok(EnqueueOutcome::Deduped);
        }
        entry.dedup.insert(item.dedup_key());
        entry.pending.push_back(item.clone());
        let depth = entry.pending.len();
        drop(state);
        self.record_depth(&repo, depth);
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn pop_head(&self, repo: &RepoKey) -> Result<Option<WorkItem>, QueueError> {
        let mut state = self.state.lock();
        let Some(entry) = state.repos.get_mut(repo) else {
            return Ok(None);
        };
        if let Some(orphan) = &entry.processing {
            warn!("redelivering orphaned in-flight item {orphan}");
            return Ok(Some(orphan.clone()));
        }
        let item = entry.pending.pop_front();
        if let Some(item) = &item {
            entry.processing = Some(item.clone());
        }
        let depth = entry.pending.len();
        drop(state);
        self.record_depth(repo, depth);
        Ok(item)
    }

    async fn complete(&self, item: &WorkItem) -> Result<(), QueueError> {
        let repo = item.repo_key();
        let mut state = self.state.lock();
        if let Some(entry) = state.repos.get_mut(&repo) {
            entry.processing = None;
            entry.dedup.remove(&item.dedup_key());
        }
        Ok(())
    }

    async fn requeue_tail(&self, item: &WorkItem) -> Result<(), QueueError> {
        let repo = item.repo_key();
        let mut state = self.state.lock();
        let entry = state.repos.entry(repo.clone()).or_default();
        entry.processing = None;
        entry.pending.push_back(item.clone());
        let depth = entry.pending.len();
        drop(state);
        self.record_depth(&repo, depth);
        Ok(())
    }

    async fn requeue_head(&self, item: &WorkItem) -> Result<(), QueueError> {
        let repo = item.repo_key();
        let mut state = self.state.lock();
        let entry = state.repos.entry(repo.clone()).or_default();
        entry.processing = None;
        entry.pending.push_front(item.clone());
        let depth = entry.pending.len();
        drop(state);
        self.record_depth(&repo, depth);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        repo: &RepoKey,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, QueueError> {
        let mut state = self.state.lock();
        let entry = state.repos.entry(repo.clone()).or_default();
        let now = Instant::now();
        if let Some((_, expires)) = &entry.lease
            && *expires > now
        {
            return Ok(None);
        }
        let token = LeaseToken::generate();
        entry.lease = Some((token.as_str().to_string(), now + ttl));
        Ok(Some(token))
    }

    async fn refresh_lease(
        &self,
        repo: &RepoKey,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<LeaseStatus, QueueError> {
        let mut state = self.state.lock();
        let Some(entry) = state.repos.get_mut(repo) else {
            return Ok(LeaseStatus::Lost);
        };
        let now = Instant::now();
        match &entry.lease {
            Some((held, expires)) if held == token.as_str() && *expires > now => {
                entry.lease = Some((held.clone(), now + ttl));
                Ok(LeaseStatus::Held)
            }
            _ => Ok(LeaseStatus::Lost),
        }
    }

    async fn release_lease(
        &self,
        repo: &RepoKey,
        token: &LeaseToken,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if let Some(entry) = state.repos.get_mut(repo)
            && let Some((held, _)) = &entry.lease
            && held == token.as_str()
        {
            entry.lease = None;
        }
        Ok(())
    }

    async fn set_throttle(
        &self,
        installation_id: u64,
        until: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.state.lock().throttles.insert(installation_id, until);
        Ok(())
    }

    async fn get_throttle(
        &self,
        installation_id: u64,
    ) -> Result<Option<DateTime<Utc>>, QueueError> {
        let mut state = self.state.lock();
        match state.throttles.get(&installation_id) {
            Some(until) if *until > Utc::now() => Ok(Some(*until)),
            Some(_) => {
                state.throttles.remove(&installation_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn push_dlq(&self, item: &WorkItem, reason: &str) -> Result<(), QueueError> {
        let repo = item.repo_key();
        let mut state = self.state.lock();
        let entry = state.repos.entry(repo).or_default();
        entry.processing = None;
        entry.dedup.remove(&item.dedup_key());
        entry.dlq.push(DlqEntry {
            item: item.clone(),
            reason: reason.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn repos_with_work(&self) -> Result<Vec<RepoKey>, QueueError> {
        let state = self.state.lock();
        Ok(state
            .repos
            .iter()
            .filter(|(_, entry)| !entry.pending.is_empty() || entry.processing.is_some())
            .map(|(repo, _)| repo.clone())
            .collect())
    }

    async fn queue_depth(&self, repo: &RepoKey) -> Result<u64, QueueError> {
        let state = self.state.lock();
        Ok(state
            .repos
            .get(repo)
            .map(|entry| entry.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn oldest_age(&self, repo: &RepoKey) -> Result<Option<Duration>, QueueError> {
        let state = self.state.lock();
        Ok(state
            .repos
            .get(repo)
            .and_then(|entry| entry.pending.front())
            .map(|item| {
                Duration::from_secs((Utc::now() - item.enqueued_at).num_seconds().max(0) as u64)
            }))
    }

    async fn dlq_entries(&self, repo: &RepoKey) -> Result<Vec<DlqEntry>, QueueError> {
        let state = self.state.lock();
        Ok(state
            .repos
            .get(repo)
            .map(|entry| entry.dlq.clone())
            .unwrap_or_default())
    }

    async fn replay_dlq(&self, repo: &RepoKey) -> Result<u64, QueueError> {
        let entries = {
            let mut state = self.state.lock();
            match state.repos.get_mut(repo) {
                Some(entry) => std::mem::take(&mut entry.dlq),
                None => Vec::new(),
            }
        };
        let mut replayed = 0;
        for entry in entries {
            let mut item = entry.item;
            item.attempt = 0;
            item.first_seen_at = Utc::now();
            item.starvation_requeued = false;
            if self.enqueue(&item).await? == EnqueueOutcome::Enqueued {
                replayed += 1;
            }
        }
        Ok(replayed)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryQueueStore {
        MemoryQueueStore::new(Arc::new(Metrics::new().unwrap()))
    }

    #[tokio::test]
    async fn enqueue_dedups_queued_and_inflight() {
        let store = store();
        let item = WorkItem::new(1, "o", "r", 5);
        assert_eq!(store.enqueue(&item).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(store.enqueue(&item).await.unwrap(), EnqueueOutcome::Deduped);

        // Still deduped while in-flight.
        let popped = store.pop_head(&item.repo_key()).await.unwrap().unwrap();
        assert_eq!(popped.pr_number, 5);
        assert_eq!(store.enqueue(&item).await.unwrap(), EnqueueOutcome::Deduped);

        // After completion the PR may be enqueued again.
        store.complete(&popped).await.unwrap();
        assert_eq!(store.enqueue(&item).await.unwrap(), EnqueueOutcome::Enqueued);
    }

    #[tokio::test]
    async fn pop_preserves_fifo_order() {
        let store = store();
        for n in [1, 2, 3] {
            store.enqueue(&WorkItem::new(1, "o", "r", n)).await.unwrap();
        }
        let repo = RepoKey::new(1, "o", "r");
        for expected in [1, 2, 3] {
            let item = store.pop_head(&repo).await.unwrap().unwrap();
            assert_eq!(item.pr_number, expected);
            store.complete(&item).await.unwrap();
        }
        assert!(store.pop_head(&repo).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphaned_item_redelivered() {
        let store = store();
        let item = WorkItem::new(1, "o", "r", 9);
        store.enqueue(&item).await.unwrap();
        let repo = item.repo_key();

        let first = store.pop_head(&repo).await.unwrap().unwrap();
        // Worker dies here without completing; the next pop redelivers.
        let second = store.pop_head(&repo).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert!(!store.repos_with_work().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_is_exclusive_until_expiry() {
        let store = store();
        let repo = RepoKey::new(1, "o", "r");
        let ttl = Duration::from_secs(30);

        let token = store.acquire_lease(&repo, ttl).await.unwrap().unwrap();
        assert!(store.acquire_lease(&repo, ttl).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let taken_over = store.acquire_lease(&repo, ttl).await.unwrap().unwrap();

        // The old holder can no longer refresh or release.
        assert_eq!(
            store.refresh_lease(&repo, &token, ttl).await.unwrap(),
            LeaseStatus::Lost
        );
        store.release_lease(&repo, &token).await.unwrap();
        assert_eq!(
            store
                .refresh_lease(&repo, &taken_over, ttl)
                .await
                .unwrap(),
            LeaseStatus::Held
        );
    }

    #[tokio::test]
    async fn dlq_clears_dedup_and_replays() {
        let store = store();
        let item = WorkItem::new(1, "o", "r", 4);
        store.enqueue(&item).await.unwrap();
        let repo = item.repo_key();
        let popped = store.pop_head(&repo).await.unwrap().unwrap();
        store.push_dlq(&popped, "checks_timeout").await.unwrap();

        // Dedup entry is gone (invariant 4); the PR can re-enter.
        assert_eq!(store.enqueue(&item).await.unwrap(), EnqueueOutcome::Enqueued);
        let requeued = store.pop_head(&repo).await.unwrap().unwrap();
        store.complete(&requeued).await.unwrap();

        assert_eq!(store.dlq_entries(&repo).await.unwrap().len(), 1);
        assert_eq!(store.replay_dlq(&repo).await.unwrap(), 1);
        let replayed = store.pop_head(&repo).await.unwrap().unwrap();
        assert_eq!(replayed.attempt, 0);
        assert!(store.dlq_entries(&repo).await.unwrap().is_empty());
    }
}
