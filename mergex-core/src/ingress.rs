//! Webhook event normalization.
//!
//! Events arrive as untyped JSON documents; this module decides whether a
//! delivery maps to a work item and enqueues it. Only the typed
//! [`WorkItem`] ever reaches the queue — the pipeline never sees raw
//! payloads. Eligibility here is a cheap pre-filter on the default label;
//! the authoritative policy check happens under the repo lease.

use crate::metrics::Metrics;
use crate::model::WorkItem;
use crate::policy::DEFAULT_LABEL;
use crate::queue::{EnqueueOutcome, QueueError, QueueStore};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pull request actions that can change merge eligibility.
const PR_ACTIONS: &[&str] = &[
    "opened",
    "reopened",
    "synchronize",
    "labeled",
    "unlabeled",
    "ready_for_review",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    Enqueued,
    Deduped,
    Ignored,
}

pub struct Ingress {
    store: Arc<dyn QueueStore>,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for Ingress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingress").finish()
    }
}

/// Repository coordinates plus the PR numbers an event touches.
struct EventTarget {
    installation_id: u64,
    owner: String,
    repo: String,
    pr_numbers: Vec<u64>,
}

impl Ingress {
    pub fn new(store: Arc<dyn QueueStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    /// Map one validated event into zero or one enqueue per PR it names.
    pub async fn handle(
        &self,
        event_type: &str,
        payload: &Value,
    ) -> Result<IngressOutcome, QueueError> {
        let target = match event_type {
            "pull_request" => self.pull_request_target(payload),
            "check_suite" => self.check_suite_target(payload),
            "status" => self.status_target(payload),
            _ => None,
        };

        let Some(target) = target else {
            self.metrics
                .events_ignored_total
                .with_label_values(&[event_type])
                .inc();
            return Ok(IngressOutcome::Ignored);
        };

        let mut outcome = IngressOutcome::Ignored;
        for pr_number in &target.pr_numbers {
            let item = WorkItem::new(
                target.installation_id,
                target.owner.clone(),
                target.repo.clone(),
                *pr_number,
            );
            match self.store.enqueue(&item).await? {
                EnqueueOutcome::Enqueued => {
                    self.metrics
                        .events_enqueued_total
                        .with_label_values(&[event_type])
                        .inc();
                    debug!("enqueued {item} from {event_type}");
                    outcome = IngressOutcome::Enqueued;
                }
                EnqueueOutcome::Deduped => {
                    self.metrics.events_deduped_total.inc();
                    if outcome != IngressOutcome::Enqueued {
                        outcome = IngressOutcome::Deduped;
                    }
                }
            }
        }

        if outcome == IngressOutcome::Ignored {
            self.metrics
                .events_ignored_total
                .with_label_values(&[event_type])
                .inc();
        }
        Ok(outcome)
    }

    fn coordinates(&self, payload: &Value) -> Option<(u64, String, String)> {
        let installation_id = payload.get("installation")?.get("id")?.as_u64()?;
        let repository = payload.get("repository")?;
        let owner = repository.get("owner")?.get("login")?.as_str()?;
        let repo = repository.get("name")?.as_str()?;
        Some((installation_id, owner.to_string(), repo.to_string()))
    }

    fn pull_request_target(&self, payload: &Value) -> Option<EventTarget> {
        let action = payload.get("action")?.as_str()?;
        if !PR_ACTIONS.contains(&action) {
            return None;
        }
        let (installation_id, owner, repo) = self.coordinates(payload)?;
        let pr = payload.get("pull_request")?;
        let number = pr.get("number")?.as_u64()?;

        if pr.get("state").and_then(Value::as_str) != Some("open") {
            return None;
        }
        if pr.get("draft").and_then(Value::as_bool) == Some(true) {
            return None;
        }
        let labeled = pr
            .get("labels")
            .and_then(Value::as_array)
            .is_some_and(|labels| {
                labels.iter().any(|l| {
                    l.get("name")
                        .and_then(Value::as_str)
                        .is_some_and(|name| name.eq_ignore_ascii_case(DEFAULT_LABEL))
                })
            });
        if !labeled {
            return None;
        }

        Some(EventTarget {
            installation_id,
            owner,
            repo,
            pr_numbers: vec![number],
        })
    }

    fn check_suite_target(&self, payload: &Value) -> Option<EventTarget> {
        if payload.get("action").and_then(Value::as_str) != Some("completed") {
            return None;
        }
        let (installation_id, owner, repo) = self.coordinates(payload)?;
        let pr_numbers =
            Self::pr_numbers(payload.get("check_suite")?.get("pull_requests")?)?;
        Some(EventTarget {
            installation_id,
            owner,
            repo,
            pr_numbers,
        })
    }

    fn status_target(&self, payload: &Value) -> Option<EventTarget> {
        let (installation_id, owner, repo) = self.coordinates(payload)?;
        // Status payloads only sometimes carry the PR list; without one
        // there is nothing to target and the event is counted as ignored.
        let pr_numbers = Self::pr_numbers(payload.get("pull_requests")?)?;
        Some(EventTarget {
            installation_id,
            owner,
            repo,
            pr_numbers,
        })
    }

    fn pr_numbers(list: &Value) -> Option<Vec<u64>> {
        let numbers: Vec<u64> = list
            .as_array()?
            .iter()
            .filter_map(|pr| pr.get("number").and_then(Value::as_u64))
            .collect();
        if numbers.is_empty() {
            warn!("event carried an empty pull request list");
            return None;
        }
        Some(numbers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueueStore;
    use serde_json::json;

    fn ingress() -> (Ingress, Arc<MemoryQueueStore>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(MemoryQueueStore::new(metrics.clone()));
        (
            Ingress::new(store.clone(), metrics.clone()),
            store,
            metrics,
        )
    }

    fn pr_event(number: u64, labels: &[&str], draft: bool) -> Value {
        json!({
            "action": "synchronize",
            "installation": {"id": 42},
            "repository": {"name": "widgets", "owner": {"login": "octo"}},
            "pull_request": {
                "number": number,
                "state": "open",
                "draft": draft,
                "labels": labels.iter().map(|l| json!({"name": l})).collect::<Vec<_>>(),
            }
        })
    }

    #[tokio::test]
    async fn labeled_open_pr_enqueues() {
        let (ingress, _, metrics) = ingress();
        let outcome = ingress
            .handle("pull_request", &pr_event(7, &["automerge"], false))
            .await
            .unwrap();
        assert_eq!(outcome, IngressOutcome::Enqueued);
        assert_eq!(
            metrics
                .events_enqueued_total
                .with_label_values(&["pull_request"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn drafts_and_unlabeled_prs_ignored() {
        let (ingress, _, _) = ingress();
        assert_eq!(
            ingress
                .handle("pull_request", &pr_event(7, &["automerge"], true))
                .await
                .unwrap(),
            IngressOutcome::Ignored
        );
        assert_eq!(
            ingress
                .handle("pull_request", &pr_event(7, &["bug"], false))
                .await
                .unwrap(),
            IngressOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn duplicate_deliveries_dedupe() {
        let (ingress, _, metrics) = ingress();
        let event = pr_event(42, &["automerge"], false);
        for _ in 0..3 {
            ingress.handle("pull_request", &event).await.unwrap();
        }
        assert_eq!(
            metrics
                .events_enqueued_total
                .with_label_values(&["pull_request"])
                .get(),
            1
        );
        assert_eq!(metrics.events_deduped_total.get(), 2);
    }

    #[tokio::test]
    async fn check_suite_enqueues_each_listed_pr() {
        let (ingress, store, _) = ingress();
        let event = json!({
            "action": "completed",
            "installation": {"id": 42},
            "repository": {"name": "widgets", "owner": {"login": "octo"}},
            "check_suite": {
                "head_sha": "a".repeat(40),
                "pull_requests": [{"number": 1}, {"number": 2}],
            }
        });
        assert_eq!(
            ingress.handle("check_suite", &event).await.unwrap(),
            IngressOutcome::Enqueued
        );
        let repo = crate::model::RepoKey::new(42, "octo", "widgets");
        assert_eq!(store.queue_depth(&repo).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_event_types_ignored() {
        let (ingress, _, metrics) = ingress();
        assert_eq!(
            ingress.handle("push", &json!({})).await.unwrap(),
            IngressOutcome::Ignored
        );
        assert_eq!(
            metrics.events_ignored_total.with_label_values(&["push"]).get(),
            1
        );
    }
}
