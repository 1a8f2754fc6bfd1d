//! Worker pool driving repo queues.
//!
//! Each worker loops over the repos that currently have work, skipping
//! throttled installations, and claims at most one repo at a time via the
//! store lease. The pipeline result is then settled back into the store:
//! complete, dead-letter, or requeue. Rotation starts at a random offset so
//! concurrent workers fan out across repos instead of piling onto the first.

use crate::metrics::Metrics;
use crate::model::{RepoKey, WorkItem};
use crate::pipeline::{Heartbeat, Pipeline, RunOutcome};
use crate::queue::{QueueError, QueueStore};
use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub lease_ttl: Duration,
    /// Lease refresh cadence; must stay well under half the TTL so one
    /// missed beat cannot lose the lease.
    pub heartbeat_interval: Duration,
    pub max_retries: u32,
    pub idle_sleep: Duration,
    pub idle_jitter: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            lease_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            max_retries: 5,
            idle_sleep: Duration::from_millis(500),
            idle_jitter: Duration::from_millis(250),
        }
    }
}

struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

pub struct Scheduler {
    workers: Vec<Worker>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Scheduler {
    pub fn start(
        config: SchedulerConfig,
        store: Arc<dyn QueueStore>,
        pipeline: Arc<Pipeline>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            let config = config.clone();
            let store = store.clone();
            let pipeline = pipeline.clone();
            let metrics = metrics.clone();
            let handle = tokio::spawn(async move {
                worker_loop(id, config, store, pipeline, metrics, shutdown_rx).await;
            });
            workers.push(Worker {
                id,
                handle,
                shutdown_tx,
            });
        }
        info!("started {} merge workers", workers.len());
        Self { workers }
    }

    /// Stop all workers. In-flight pipeline runs are cancelled; their items
    /// stay in the in-flight slot and are redelivered once the lease
    /// expires, possibly in another process.
    pub async fn shutdown(self) {
        for worker in &self.workers {
            let _ = worker.shutdown_tx.send(()).await;
        }
        let ids: Vec<usize> = self.workers.iter().map(|w| w.id).collect();
        let handles = self.workers.into_iter().map(|w| w.handle);
        for (id, result) in ids.into_iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                warn!("worker {id} did not stop cleanly: {e}");
            }
        }
        info!("all merge workers stopped");
    }
}

async fn worker_loop(
    id: usize,
    config: SchedulerConfig,
    store: Arc<dyn QueueStore>,
    pipeline: Arc<Pipeline>,
    metrics: Arc<Metrics>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    info!("worker {id} started");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("worker {id} shutting down");
                break;
            }
            result = drain_one(&config, &store, &pipeline, &metrics) => {
                match result {
                    Ok(true) => {}
                    Ok(false) => {
                        let jitter_ms = config.idle_jitter.as_millis() as u64;
                        let jitter = if jitter_ms > 0 {
                            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
                        } else {
                            Duration::ZERO
                        };
                        tokio::time::sleep(config.idle_sleep + jitter).await;
                    }
                    Err(e) => {
                        error!("worker {id} store scan failed: {e}");
                        tokio::time::sleep(config.idle_sleep).await;
                    }
                }
            }
        }
    }
}

/// Find one repo with claimable work and drain a single item from it.
/// Returns `Ok(false)` when nothing was claimable this pass.
async fn drain_one(
    config: &SchedulerConfig,
    store: &Arc<dyn QueueStore>,
    pipeline: &Pipeline,
    metrics: &Metrics,
) -> Result<bool, QueueError> {
    let repos = store.repos_with_work().await?;
    if repos.is_empty() {
        return Ok(false);
    }

    let offset = rand::rng().random_range(0..repos.len());
    for i in 0..repos.len() {
        let repo = &repos[(offset + i) % repos.len()];

        match store.get_throttle(repo.installation_id).await? {
            Some(until) => {
                debug!("skipping {repo}: installation throttled until {until}");
                continue;
            }
            None => {
                metrics
                    .backpressure_active
                    .with_label_values(&[&repo.installation_id.to_string()])
                    .set(0);
            }
        }

        let Some(token) = store.acquire_lease(repo, config.lease_ttl).await? else {
            metrics.worker_lock_failed_total.inc();
            continue;
        };
        metrics.worker_lock_acquired_total.inc();

        let Some(item) = store.pop_head(repo).await? else {
            store.release_lease(repo, &token).await?;
            continue;
        };

        if let Some(age) = store.oldest_age(repo).await? {
            metrics
                .queue_oldest_age_seconds
                .with_label_values(&[&repo.to_string()])
                .set(age.as_secs() as i64);
        }

        metrics.worker_active.inc();
        let timer = metrics.worker_processing_seconds.start_timer();
        let mut heartbeat = Heartbeat::new(
            store.as_ref(),
            repo,
            &token,
            config.lease_ttl,
            config.heartbeat_interval,
        );
        let outcome = pipeline.run(&item, &mut heartbeat).await;
        timer.observe_duration();
        metrics.worker_active.dec();

        let lease_lost = outcome == RunOutcome::LeaseLost;
        settle(config, store, metrics, &item, outcome).await?;
        if !lease_lost {
            store.release_lease(repo, &token).await?;
        }
        return Ok(true);
    }

    Ok(false)
}

/// Apply a pipeline verdict to the store.
async fn settle(
    config: &SchedulerConfig,
    store: &Arc<dyn QueueStore>,
    metrics: &Metrics,
    item: &WorkItem,
    outcome: RunOutcome,
) -> Result<(), QueueError> {
    match outcome {
        RunOutcome::Done => store.complete(item).await,
        RunOutcome::Drop(reason) => {
            debug!("completed {item} without merge: {}", reason.as_str());
            store.complete(item).await
        }
        RunOutcome::Dlq(reason) => {
            store.push_dlq(item, &reason).await?;
            metrics.dlq_pushes_total.inc();
            Ok(())
        }
        RunOutcome::Retry {
            front,
            bump,
            reason,
        } => {
            let mut next = item.clone();
            if bump {
                next.attempt += 1;
                metrics.retries_total.inc();
            }
            if next.attempt > config.max_retries {
                warn!("retry budget exhausted for {item}: {reason}");
                store.push_dlq(&next, &reason).await?;
                metrics.dlq_pushes_total.inc();
            } else if front {
                store.requeue_head(&next).await?;
            } else {
                store.requeue_tail(&next).await?;
            }
            Ok(())
        }
        RunOutcome::Starved => {
            let mut next = item.clone();
            next.first_seen_at = Utc::now();
            next.starvation_requeued = true;
            store.requeue_tail(&next).await?;
            metrics.starvation_requeue_total.inc();
            info!("moved long-waiting {item} to the tail of its repo queue");
            Ok(())
        }
        RunOutcome::LeaseLost => {
            metrics.worker_lock_lost_total.inc();
            warn!("lease lost while processing {item}; leaving it in flight");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueueStore;

    #[tokio::test]
    async fn settle_requeues_until_budget_then_dead_letters() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new(metrics.clone()));
        let config = SchedulerConfig {
            max_retries: 2,
            ..SchedulerConfig::default()
        };
        let repo = RepoKey::new(1, "o", "r");

        let mut item = WorkItem::new(1, "o", "r", 9);
        store.enqueue(&item).await.unwrap();

        for expected_attempt in 1..=2 {
            let popped = store.pop_head(&repo).await.unwrap().unwrap();
            settle(
                &config,
                &store,
                &metrics,
                &popped,
                RunOutcome::Retry {
                    front: false,
                    bump: true,
                    reason: "checks_timeout".to_string(),
                },
            )
            .await
            .unwrap();
            item = store.pop_head(&repo).await.unwrap().unwrap();
            assert_eq!(item.attempt, expected_attempt);
            store.requeue_head(&item).await.unwrap();
        }

        // Third bump exceeds the budget of 2 and dead-letters.
        let popped = store.pop_head(&repo).await.unwrap().unwrap();
        settle(
            &config,
            &store,
            &metrics,
            &popped,
            RunOutcome::Retry {
                front: false,
                bump: true,
                reason: "checks_timeout".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(store.pop_head(&repo).await.unwrap().is_none());
        assert_eq!(store.dlq_entries(&repo).await.unwrap().len(), 1);
        assert_eq!(metrics.retries_total.get(), 3);
        assert_eq!(metrics.dlq_pushes_total.get(), 1);
    }

    #[tokio::test]
    async fn settle_starvation_resets_window_and_marks_item() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new(metrics.clone()));
        let config = SchedulerConfig::default();
        let repo = RepoKey::new(1, "o", "r");

        let item = WorkItem::new(1, "o", "r", 3);
        let enqueued_at = item.enqueued_at;
        store.enqueue(&item).await.unwrap();
        let popped = store.pop_head(&repo).await.unwrap().unwrap();

        settle(&config, &store, &metrics, &popped, RunOutcome::Starved)
            .await
            .unwrap();

        let requeued = store.pop_head(&repo).await.unwrap().unwrap();
        assert!(requeued.starvation_requeued);
        assert_eq!(requeued.enqueued_at, enqueued_at);
        assert!(requeued.first_seen_at > item.first_seen_at || requeued.first_seen_at >= enqueued_at);
        assert_eq!(metrics.starvation_requeue_total.get(), 1);
    }
}
