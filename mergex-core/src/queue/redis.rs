//! Redis-backed queue store.
//!
//! Every multi-step state change runs as a Lua script so the invariants
//! hold under concurrent workers and across process crashes. Leases are
//! plain `SET NX PX` keys with token-guarded refresh/release scripts.

use super::{DlqEntry, EnqueueOutcome, LeaseStatus, LeaseToken, QueueError, QueueStore};
use crate::metrics::Metrics;
use crate::model::{RepoKey, WorkItem};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Atomic multi-key operations. Scripts receive fully-derived keys; key
/// construction stays on the Rust side.
mod scripts {
    use redis::Script;

    /// KEYS: dedup set, pending list, active-repo set.
    /// ARGV: dedup member, item JSON, repo key string.
    /// Returns {enqueued, depth}.
    pub fn enqueue() -> Script {
        Script::new(
            r#"
            if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
                return {0, redis.call('LLEN', KEYS[2])}
            end
            redis.call('SADD', KEYS[1], ARGV[1])
            redis.call('RPUSH', KEYS[2], ARGV[2])
            redis.call('SADD', KEYS[3], ARGV[3])
            return {1, redis.call('LLEN', KEYS[2])}
            "#,
        )
    }

    /// KEYS: pending list, processing list.
    /// Redelivers an orphaned in-flight item before popping anything new.
    pub fn pop_head() -> Script {
        Script::new(
            r#"
            local orphan = redis.call('LRANGE', KEYS[2], 0, 0)
            if orphan[1] then
                return orphan[1]
            end
            return redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
            "#,
        )
    }

    /// KEYS: processing list, dedup set, pending list, active-repo set.
    /// ARGV: dedup member, repo key string.
    /// The processing list holds at most one element under the repo lease.
    pub fn complete() -> Script {
        Script::new(
            r#"
            redis.call('LPOP', KEYS[1])
            redis.call('SREM', KEYS[2], ARGV[1])
            if redis.call('LLEN', KEYS[3]) == 0 and redis.call('SCARD', KEYS[2]) == 0 then
                redis.call('SREM', KEYS[4], ARGV[2])
            end
            return redis.call('LLEN', KEYS[3])
            "#,
        )
    }

    /// KEYS: processing list, pending list.
    /// ARGV: item JSON, 'head' | 'tail'.
    pub fn requeue() -> Script {
        Script::new(
            r#"
            redis.call('LPOP', KEYS[1])
            if ARGV[2] == 'head' then
                redis.call('LPUSH', KEYS[2], ARGV[1])
            else
                redis.call('RPUSH', KEYS[2], ARGV[1])
            end
            return redis.call('LLEN', KEYS[2])
            "#,
        )
    }

    /// KEYS: processing list, dedup set, dlq list, pending list, active-repo set.
    /// ARGV: dedup member, DLQ entry JSON, repo key string.
    pub fn push_dlq() -> Script {
        Script::new(
            r#"
            redis.call('LPOP', KEYS[1])
            redis.call('SREM', KEYS[2], ARGV[1])
            redis.call('RPUSH', KEYS[3], ARGV[2])
            if redis.call('LLEN', KEYS[4]) == 0 and redis.call('SCARD', KEYS[2]) == 0 then
                redis.call('SREM', KEYS[5], ARGV[3])
            end
            return redis.call('LLEN', KEYS[3])
            "#,
        )
    }

    /// KEYS: lock key. ARGV: token, ttl millis.
    pub fn refresh_lease() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            end
            return 0
            "#,
        )
    }

    /// KEYS: lock key. ARGV: token.
    pub fn release_lease() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
    }
}

pub struct RedisQueueStore {
    conn: ConnectionManager,
    namespace: String,
    metrics: Arc<Metrics>,
    enqueue_script: redis::Script,
    pop_script: redis::Script,
    complete_script: redis::Script,
    requeue_script: redis::Script,
    dlq_script: redis::Script,
    refresh_script: redis::Script,
    release_script: redis::Script,
}

impl fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RedisQueueStore {
    pub async fn connect(
        redis_url: &str,
        namespace: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, QueueError> {
        let namespace = namespace.into();
        info!("Connecting to Redis queue store at {redis_url} (ns {namespace})");

        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            namespace,
            metrics,
            enqueue_script: scripts::enqueue(),
            pop_script: scripts::pop_head(),
            complete_script: scripts::complete(),
            requeue_script: scripts::requeue(),
            dlq_script: scripts::push_dlq(),
            refresh_script: scripts::refresh_lease(),
            release_script: scripts::release_lease(),
        })
    }

    fn pending_key(&self, repo: &RepoKey) -> String {
        format!("{}:q:{repo}", self.namespace)
    }

    fn processing_key(&self, repo: &RepoKey) -> String {
        format!("{}:p:{repo}", self.namespace)
    }

    fn dedup_key(&self, repo: &RepoKey) -> String {
        format!("{}:d:{repo}", self.namespace)
    }

    fn lock_key(&self, repo: &RepoKey) -> String {
        format!("{}:lock:{repo}", self.namespace)
    }

    fn throttle_key(&self, installation_id: u64) -> String {
        format!("{}:throttle:{installation_id}", self.namespace)
    }

    fn dlq_key(&self, repo: &RepoKey) -> String {
        format!("{}:dlq:{repo}", self.namespace)
    }

    fn repos_key(&self) -> String {
        format!("{}:repos", self.namespace)
    }

    fn record_depth(&self, repo: &RepoKey, depth: i64) {
        self.metrics
            .queue_depth
            .with_label_values(&[&repo.to_string()])
            .set(depth);
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, item: &WorkItem) -> Result<EnqueueOutcome, QueueError> {
        let repo = item.repo_key();
        let payload = serde_json::to_string(item)?;
        let mut conn = self.conn.clone();
        let (enqueued, depth): (i64, i64) = self
            .enqueue_script
            .key(self.dedup_key(&repo))
            .key(self.pending_key(&repo))
            .key(self.repos_key())
            .arg(item.dedup_key())
            .arg(payload)
            .arg(repo.to_string())
            .invoke_async(&mut conn)
            .await?;

        self.record_depth(&repo, depth);
        if enqueued == 1 {
            debug!("enqueued {item} for {repo}");
            Ok(EnqueueOutcome::Enqueued)
        } else {
            debug!("deduped {item} for {repo}");
            Ok(EnqueueOutcome::Deduped)
        }
    }

    async fn pop_head(&self, repo: &RepoKey) -> Result<Option<WorkItem>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .pop_script
            .key(self.pending_key(repo))
            .key(self.processing_key(repo))
            .invoke_async(&mut conn)
            .await?;

        match raw {
            Some(json) => {
                let item: WorkItem = serde_json::from_str(&json)?;
                let depth: i64 = redis::cmd("LLEN")
                    .arg(self.pending_key(repo))
                    .query_async(&mut conn)
                    .await?;
                self.record_depth(repo, depth);
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, item: &WorkItem) -> Result<(), QueueError> {
        let repo = item.repo_key();
        let mut conn = self.conn.clone();
        let depth: i64 = self
            .complete_script
            .key(self.processing_key(&repo))
            .key(self.dedup_key(&repo))
            .key(self.pending_key(&repo))
            .key(self.repos_key())
            .arg(item.dedup_key())
            .arg(repo.to_string())
            .invoke_async(&mut conn)
            .await?;
        self.record_depth(&repo, depth);
        Ok(())
    }

    async fn requeue_tail(&self, item: &WorkItem) -> Result<(), QueueError> {
        let repo = item.repo_key();
        let payload = serde_json::to_string(item)?;
        let mut conn = self.conn.clone();
        let depth: i64 = self
            .requeue_script
            .key(self.processing_key(&repo))
            .key(self.pending_key(&repo))
            .arg(payload)
            .arg("tail")
            .invoke_async(&mut conn)
            .await?;
        self.record_depth(&repo, depth);
        Ok(())
    }

    async fn requeue_head(&self, item: &WorkItem) -> Result<(), QueueError> {
        let repo = item.repo_key();
        let payload = serde_json::to_string(item)?;
        let mut conn = self.conn.clone();
        let depth: i64 = self
            .requeue_script
            .key(self.processing_key(&repo))
            .key(self.pending_key(&repo))
            .arg(payload)
            .arg("head")
            .invoke_async(&mut conn)
            .await?;
        self.record_depth(&repo, depth);
        Ok(())
    }

    async fn acquire_lease(
        &self,
        repo: &RepoKey,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, QueueError> {
        let token = LeaseToken::generate();
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(repo))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(set.map(|_| token))
    }

    async fn refresh_lease(
        &self,
        repo: &RepoKey,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<LeaseStatus, QueueError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .refresh_script
            .key(self.lock_key(repo))
            .arg(token.as_str())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        if refreshed == 1 {
            Ok(LeaseStatus::Held)
        } else {
            warn!("lease on {repo} no longer held by this worker");
            Ok(LeaseStatus::Lost)
        }
    }

    async fn release_lease(
        &self,
        repo: &RepoKey,
        token: &LeaseToken,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(self.lock_key(repo))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_throttle(
        &self,
        installation_id: u64,
        until: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let window = (until - Utc::now()).num_milliseconds().max(0) as u64;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.throttle_key(installation_id))
            .arg(until.timestamp_millis())
            .arg("PX")
            .arg(window.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_throttle(
        &self,
        installation_id: u64,
    ) -> Result<Option<DateTime<Utc>>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<i64> = redis::cmd("GET")
            .arg(self.throttle_key(installation_id))
            .query_async(&mut conn)
            .await?;
        Ok(raw.and_then(|millis| Utc.timestamp_millis_opt(millis).single()))
    }

    async fn push_dlq(&self, item: &WorkItem, reason: &str) -> Result<(), QueueError> {
        let repo = item.repo_key();
        let entry = DlqEntry {
            item: item.clone(),
            reason: reason.to_string(),
            dead_at: Utc::now(),
        };
        let payload = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();
        let dlq_len: i64 = self
            .dlq_script
            .key(self.processing_key(&repo))
            .key(self.dedup_key(&repo))
            .key(self.dlq_key(&repo))
            .key(self.pending_key(&repo))
            .key(self.repos_key())
            .arg(item.dedup_key())
            .arg(payload)
            .arg(repo.to_string())
            .invoke_async(&mut conn)
            .await?;
        warn!("dead-lettered {item} for {repo}: {reason} (dlq size {dlq_len})");
        Ok(())
    }

    async fn repos_with_work(&self) -> Result<Vec<RepoKey>, QueueError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.repos_key())
            .query_async(&mut conn)
            .await?;
        let mut repos = Vec::with_capacity(members.len());
        for member in members {
            match member.parse() {
                Ok(repo) => repos.push(repo),
                Err(e) => warn!("skipping unparseable repo registry entry: {e}"),
            }
        }
        Ok(repos)
    }

    async fn queue_depth(&self, repo: &RepoKey) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let depth: i64 = redis::cmd("LLEN")
            .arg(self.pending_key(repo))
            .query_async(&mut conn)
            .await?;
        Ok(depth.max(0) as u64)
    }

    async fn oldest_age(&self, repo: &RepoKey) -> Result<Option<Duration>, QueueError> {
        let mut conn = self.conn.clone();
        let head: Option<String> = redis::cmd("LINDEX")
            .arg(self.pending_key(repo))
            .arg(0)
            .query_async(&mut conn)
            .await?;
        let Some(json) = head else {
            return Ok(None);
        };
        let item: WorkItem = serde_json::from_str(&json)?;
        let age = (Utc::now() - item.enqueued_at).num_seconds().max(0) as u64;
        Ok(Some(Duration::from_secs(age)))
    }

    async fn dlq_entries(&self, repo: &RepoKey) -> Result<Vec<DlqEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.dlq_key(repo))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let mut entries = Vec::with_capacity(raw.len());
        for json in raw {
            entries.push(serde_json::from_str(&json)?);
        }
        Ok(entries)
    }

    async fn replay_dlq(&self, repo: &RepoKey) -> Result<u64, QueueError> {
        let mut replayed = 0;
        loop {
            let mut conn = self.conn.clone();
            let raw: Option<String> = redis::cmd("LPOP")
                .arg(self.dlq_key(repo))
                .query_async(&mut conn)
                .await?;
            let Some(json) = raw else { break };
            let entry: DlqEntry = serde_json::from_str(&json)?;
            let mut item = entry.item;
            item.attempt = 0;
            item.first_seen_at = Utc::now();
            item.starvation_requeued = false;
            if self.enqueue(&item).await? == EnqueueOutcome::Enqueued {
                replayed += 1;
            }
        }
        info!("replayed {replayed} dead-lettered items for {repo}");
        Ok(replayed)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
