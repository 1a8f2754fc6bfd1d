//! Durable queue store.
//!
//! Each repository owns an ordered pending list, a dedup set, a single
//! in-flight slot, a TTL lease, and a dead-letter list. The trait below is
//! the only surface the scheduler and pipeline touch; `RedisQueueStore` is
//! the production implementation, `MemoryQueueStore` backs tests and
//! `--dev` runs.
//!
//! In-flight items live on a per-repo processing list rather than being
//! deleted at pop time. A worker that dies mid-run leaves its item there
//! with the dedup entry intact; the next lease holder is handed the same
//! item back before anything new is popped.

mod memory;
mod redis;

pub use memory::MemoryQueueStore;
pub use redis::RedisQueueStore;

use crate::model::{RepoKey, WorkItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store unreachable: {0}")]
    Connection(#[from] ::redis::RedisError),

    #[error("corrupt queue entry: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of an enqueue attempt; duplicates are collapsed, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Deduped,
}

/// Opaque nonce identifying one lease acquisition. Refresh and release only
/// act when the stored token still matches, so a stale holder cannot extend
/// or drop a lease that has already been taken over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Held,
    Lost,
}

/// A dead-lettered work item awaiting manual triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub item: WorkItem,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append an item unless its dedup key is already present (queued or
    /// in-flight).
    async fn enqueue(&self, item: &WorkItem) -> Result<EnqueueOutcome, QueueError>;

    /// Claim the repo's next item, moving it into the in-flight slot. If a
    /// previous holder crashed, its orphaned item is redelivered first.
    /// The dedup entry is kept; events for the same PR stay collapsed while
    /// the item is being worked.
    async fn pop_head(&self, repo: &RepoKey) -> Result<Option<WorkItem>, QueueError>;

    /// Drop the in-flight item and its dedup entry. Terminal for the item.
    async fn complete(&self, item: &WorkItem) -> Result<(), QueueError>;

    /// Move the in-flight item to the tail of the pending list, keeping the
    /// dedup entry. `item` carries any mutated counters.
    async fn requeue_tail(&self, item: &WorkItem) -> Result<(), QueueError>;

    /// Like [`QueueStore::requeue_tail`] but back to the head, for items
    /// that must run again before anything else in the repo.
    async fn requeue_head(&self, item: &WorkItem) -> Result<(), QueueError>;

    async fn acquire_lease(
        &self,
        repo: &RepoKey,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, QueueError>;

    async fn refresh_lease(
        &self,
        repo: &RepoKey,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<LeaseStatus, QueueError>;

    async fn release_lease(&self, repo: &RepoKey, token: &LeaseToken)
        -> Result<(), QueueError>;

    /// Install a cooldown window for every repo of an installation.
    async fn set_throttle(
        &self,
        installation_id: u64,
        until: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    async fn get_throttle(
        &self,
        installation_id: u64,
    ) -> Result<Option<DateTime<Utc>>, QueueError>;

    /// Dead-letter the in-flight item, clearing its dedup entry so future
    /// events can enqueue the PR again.
    async fn push_dlq(&self, item: &WorkItem, reason: &str) -> Result<(), QueueError>;

    /// Repos that currently have pending or in-flight work.
    async fn repos_with_work(&self) -> Result<Vec<RepoKey>, QueueError>;

    async fn queue_depth(&self, repo: &RepoKey) -> Result<u64, QueueError>;

    /// Age of the oldest pending item, if any.
    async fn oldest_age(&self, repo: &RepoKey) -> Result<Option<Duration>, QueueError>;

    async fn dlq_entries(&self, repo: &RepoKey) -> Result<Vec<DlqEntry>, QueueError>;

    /// Re-enqueue every dead-lettered item through the normal dedup gate.
    /// Returns how many items went back on the queue.
    async fn replay_dlq(&self, repo: &RepoKey) -> Result<u64, QueueError>;

    /// Liveness probe for readiness checks.
    async fn ping(&self) -> Result<(), QueueError>;
}
