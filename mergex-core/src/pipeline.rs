//! The per-item merge state machine.
//!
//! One run takes a work item from policy load through evaluation, branch
//! update, check polling, and the final guarded merge call. The run may
//! block for minutes while checks settle; the heartbeat keeps the repo
//! lease alive through those waits, and a lost lease aborts the run before
//! any further store mutation.
//!
//! The pipeline is the only place that decides retry vs terminal vs
//! throttle. It reports a [`RunOutcome`]; the scheduler applies it to the
//! queue store.

use crate::github::{
    ApiError, CheckSuite, CombinedStatus, GithubApi, MergeOutcome, MergeableState, PrSnapshot,
    PrState, RateInfo, StatusState, UpdateBranchOutcome,
};
use crate::metrics::Metrics;
use crate::model::{RepoKey, WorkItem};
use crate::policy::{render_template, RepoPolicy, TemplateContext};
use crate::queue::{LeaseStatus, LeaseToken, QueueError, QueueStore};
use chrono::{TimeDelta, Utc};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How long an item may sit at the head of its repo queue before it is
    /// moved to the tail once to let siblings progress.
    pub starvation_window: Duration,
    pub rate_limit_min_remaining: u64,
    pub rate_limit_cooldown: Duration,
    pub rate_limit_jitter: Duration,
    pub max_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            starvation_window: Duration::from_secs(900),
            rate_limit_min_remaining: 50,
            rate_limit_cooldown: Duration::from_secs(60),
            rate_limit_jitter: Duration::from_secs(30),
            max_backoff: Duration::from_secs(1800),
        }
    }
}

/// Why an item was dropped without reaching the merge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Closed,
    Draft,
    Locked,
    LabelMissing,
    MergeConflict,
    Blocked,
    Behind,
    ChecksFailed,
    NotMergeable,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Closed => "closed",
            DropReason::Draft => "draft",
            DropReason::Locked => "locked",
            DropReason::LabelMissing => "label_missing",
            DropReason::MergeConflict => "merge_conflict",
            DropReason::Blocked => "blocked_by_policy",
            DropReason::Behind => "behind_base",
            DropReason::ChecksFailed => "checks_failed",
            DropReason::NotMergeable => "not_mergeable",
        }
    }
}

/// Terminal verdict of one pipeline run, applied to the store by the
/// scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Merged; the item is complete.
    Done,
    /// Ineligible or terminally failed without dead-lettering; the item is
    /// complete and later events may enqueue the PR again.
    Drop(DropReason),
    /// Terminal failure for manual triage.
    Dlq(String),
    /// Run again. `front` puts the item back at the head of the queue,
    /// `bump` charges the retry budget.
    Retry {
        front: bool,
        bump: bool,
        reason: String,
    },
    /// The item exceeded the head-of-queue window; move it to the tail once.
    Starved,
    /// The lease expired mid-run; nothing was mutated and the next holder
    /// will pick the item up again.
    LeaseLost,
}

#[derive(Debug)]
pub struct LeaseLost;

/// Periodic lease extension during long waits. `beat` is cheap to call on
/// every tick; it only touches the store once the refresh interval has
/// elapsed.
pub struct Heartbeat<'a> {
    store: &'a dyn QueueStore,
    repo: RepoKey,
    token: LeaseToken,
    ttl: Duration,
    interval: Duration,
    last: Instant,
}

impl fmt::Debug for Heartbeat<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heartbeat").field("repo", &self.repo).finish()
    }
}

impl<'a> Heartbeat<'a> {
    pub fn new(
        store: &'a dyn QueueStore,
        repo: &RepoKey,
        token: &LeaseToken,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            repo: repo.clone(),
            token: token.clone(),
            ttl,
            interval,
            last: Instant::now(),
        }
    }

    pub async fn beat(&mut self) -> Result<(), LeaseLost> {
        if self.last.elapsed() < self.interval {
            return Ok(());
        }
        match self
            .store
            .refresh_lease(&self.repo, &self.token, self.ttl)
            .await
        {
            Ok(LeaseStatus::Held) => {
                self.last = Instant::now();
                Ok(())
            }
            Ok(LeaseStatus::Lost) => Err(LeaseLost),
            Err(e) => {
                // Can't prove the lease is still ours; abort rather than
                // keep mutating under a lock another worker may now hold.
                warn!("lease refresh for {} failed: {e}", self.repo);
                Err(LeaseLost)
            }
        }
    }
}

enum StepError {
    LeaseLost,
    Api(ApiError),
    Queue(QueueError),
}

impl From<LeaseLost> for StepError {
    fn from(_: LeaseLost) -> Self {
        StepError::LeaseLost
    }
}

impl From<ApiError> for StepError {
    fn from(e: ApiError) -> Self {
        StepError::Api(e)
    }
}

impl From<QueueError> for StepError {
    fn from(e: QueueError) -> Self {
        StepError::Queue(e)
    }
}

enum ChecksState {
    Green,
    Failing,
    Pending,
}

enum WaitVerdict {
    Green,
    Failing,
    TimedOut,
    Starved,
}

pub struct Pipeline {
    api: Arc<dyn GithubApi>,
    store: Arc<dyn QueueStore>,
    metrics: Arc<Metrics>,
    config: PipelineConfig,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").finish()
    }
}

impl Pipeline {
    pub fn new(
        api: Arc<dyn GithubApi>,
        store: Arc<dyn QueueStore>,
        metrics: Arc<Metrics>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            api,
            store,
            metrics,
            config,
        }
    }

    pub async fn run(&self, item: &WorkItem, heartbeat: &mut Heartbeat<'_>) -> RunOutcome {
        match self.run_inner(item, heartbeat).await {
            Ok(outcome) => outcome,
            Err(StepError::LeaseLost) => RunOutcome::LeaseLost,
            Err(StepError::Api(e)) => self.classify_api_error(item, e).await,
            Err(StepError::Queue(e)) => {
                warn!("store error while processing {item}: {e}");
                RunOutcome::Retry {
                    front: false,
                    bump: true,
                    reason: "store_error".to_string(),
                }
            }
        }
    }

    async fn run_inner(
        &self,
        item: &WorkItem,
        heartbeat: &mut Heartbeat<'_>,
    ) -> Result<RunOutcome, StepError> {
        let repo = item.repo_key();

        if self.starved(item) {
            return Ok(RunOutcome::Starved);
        }
        heartbeat.beat().await?;

        let mut pr = self.api.get_pr(&repo, item.pr_number).await?;
        self.observe_quota(&repo).await?;

        let policy = self.api.load_policy(&repo, &pr.base_ref).await?;
        self.observe_quota(&repo).await?;

        if let Some(reason) = Self::ineligible(&pr, &policy) {
            if reason == DropReason::Blocked {
                self.metrics.merge_blocked_total.inc();
            }
            info!("dropping {item}: {}", reason.as_str());
            return Ok(RunOutcome::Drop(reason));
        }

        if policy.require_up_to_date && pr.is_behind() {
            if !policy.update_branch {
                info!("dropping {item}: behind base and branch updates disabled");
                return Ok(RunOutcome::Drop(DropReason::Behind));
            }
            heartbeat.beat().await?;
            let outcome = self.api.update_branch(&repo, item.pr_number).await?;
            self.observe_quota(&repo).await?;
            self.metrics
                .branch_updates_total
                .with_label_values(&[outcome.as_str()])
                .inc();
            match outcome {
                UpdateBranchOutcome::Ok => {
                    // The platform synthesizes a new head; pick it up before
                    // watching checks so we wait on the right commit.
                    tokio::time::sleep(policy.poll_interval()).await;
                    heartbeat.beat().await?;
                    pr = self.api.get_pr(&repo, item.pr_number).await?;
                    self.observe_quota(&repo).await?;
                }
                UpdateBranchOutcome::NotBehind => {}
                UpdateBranchOutcome::Conflict => {
                    warn!("branch update for {item} conflicted");
                    return Ok(RunOutcome::Dlq("branch_update_failed".to_string()));
                }
            }
        }

        match self
            .wait_for_checks(&repo, item, &pr, &policy, heartbeat)
            .await?
        {
            WaitVerdict::Green => {}
            WaitVerdict::Failing => return Ok(RunOutcome::Drop(DropReason::ChecksFailed)),
            WaitVerdict::TimedOut => {
                return Ok(RunOutcome::Retry {
                    front: false,
                    bump: true,
                    reason: "checks_timeout".to_string(),
                });
            }
            WaitVerdict::Starved => return Ok(RunOutcome::Starved),
        }

        heartbeat.beat().await?;
        self.merge(&repo, item, &pr, &policy).await
    }

    fn ineligible(pr: &PrSnapshot, policy: &RepoPolicy) -> Option<DropReason> {
        if pr.state == PrState::Closed {
            return Some(DropReason::Closed);
        }
        if pr.draft {
            return Some(DropReason::Draft);
        }
        if pr.locked {
            return Some(DropReason::Locked);
        }
        if !pr.has_label(&policy.label) {
            return Some(DropReason::LabelMissing);
        }
        match pr.mergeable_state {
            MergeableState::Dirty => Some(DropReason::MergeConflict),
            MergeableState::Blocked => Some(DropReason::Blocked),
            _ => None,
        }
    }

    async fn wait_for_checks(
        &self,
        repo: &RepoKey,
        item: &WorkItem,
        pr: &PrSnapshot,
        policy: &RepoPolicy,
        heartbeat: &mut Heartbeat<'_>,
    ) -> Result<WaitVerdict, StepError> {
        let started = Instant::now();
        loop {
            heartbeat.beat().await?;
            if self.starved(item) {
                return Ok(WaitVerdict::Starved);
            }
            if started.elapsed() >= policy.max_wait() {
                self.metrics
                    .checks_wait_seconds
                    .observe(started.elapsed().as_secs_f64());
                info!(
                    "checks for {item} still pending after {}s",
                    started.elapsed().as_secs()
                );
                return Ok(WaitVerdict::TimedOut);
            }

            let combined = self.api.get_combined_status(repo, &pr.head_sha).await?;
            self.observe_quota(repo).await?;
            let suites = self.api.get_check_suites(repo, &pr.head_sha).await?;
            self.observe_quota(repo).await?;

            match Self::classify_checks(&combined, &suites, policy) {
                ChecksState::Green => {
                    self.metrics
                        .checks_wait_seconds
                        .observe(started.elapsed().as_secs_f64());
                    return Ok(WaitVerdict::Green);
                }
                ChecksState::Failing => {
                    self.metrics
                        .checks_wait_seconds
                        .observe(started.elapsed().as_secs_f64());
                    return Ok(WaitVerdict::Failing);
                }
                ChecksState::Pending => {
                    debug!("checks for {item} pending");
                }
            }
            tokio::time::sleep(policy.poll_interval()).await;
        }
    }

    fn classify_checks(
        combined: &CombinedStatus,
        suites: &[CheckSuite],
        policy: &RepoPolicy,
    ) -> ChecksState {
        if combined.state == StatusState::Failure || suites.iter().any(|s| s.failed()) {
            return ChecksState::Failing;
        }
        if combined.state == StatusState::None && suites.is_empty() {
            return if policy.allow_merge_when_no_checks {
                ChecksState::Green
            } else {
                ChecksState::Pending
            };
        }
        let statuses_ok = matches!(combined.state, StatusState::Success | StatusState::None);
        let suites_ok = suites.iter().all(|s| s.passed());
        if statuses_ok && suites_ok {
            ChecksState::Green
        } else {
            ChecksState::Pending
        }
    }

    async fn merge(
        &self,
        repo: &RepoKey,
        item: &WorkItem,
        evaluated: &PrSnapshot,
        policy: &RepoPolicy,
    ) -> Result<RunOutcome, StepError> {
        let fresh = self.api.get_pr(repo, item.pr_number).await?;
        self.observe_quota(repo).await?;

        if fresh.head_sha != evaluated.head_sha {
            info!(
                "head of {item} moved {} -> {}; re-running before merge",
                evaluated.head_sha, fresh.head_sha
            );
            return Ok(RunOutcome::Retry {
                front: true,
                bump: true,
                reason: "mismatched_sha".to_string(),
            });
        }
        if let Some(reason) = Self::ineligible(&fresh, policy) {
            if reason == DropReason::Blocked {
                self.metrics.merge_blocked_total.inc();
            }
            info!("dropping {item} at merge time: {}", reason.as_str());
            return Ok(RunOutcome::Drop(reason));
        }

        let context = TemplateContext {
            number: fresh.number,
            title: &fresh.title,
            body: &fresh.body,
            head: &fresh.head_ref,
            base: &fresh.base_ref,
            user: &fresh.user,
        };
        let title = match render_template(&policy.title_template, &context) {
            Ok(title) => title,
            Err(e) => {
                warn!("title template for {item} invalid: {e}");
                return Ok(RunOutcome::Dlq("config_invalid".to_string()));
            }
        };
        let body = match render_template(&policy.body_template, &context) {
            Ok(body) => body,
            Err(e) => {
                warn!("body template for {item} invalid: {e}");
                return Ok(RunOutcome::Dlq("config_invalid".to_string()));
            }
        };

        self.metrics.merge_attempts_total.inc();
        let outcome = self
            .api
            .merge_pr(
                repo,
                item.pr_number,
                &fresh.head_sha,
                policy.merge_method,
                &title,
                &body,
            )
            .await?;
        self.observe_quota(repo).await?;

        match outcome {
            MergeOutcome::Merged => {
                self.metrics.merges_success_total.inc();
                info!(
                    "merged {}/{}#{} via {}",
                    repo.owner,
                    repo.repo,
                    item.pr_number,
                    policy.merge_method.as_str()
                );
                Ok(RunOutcome::Done)
            }
            MergeOutcome::MismatchedSha => Ok(RunOutcome::Retry {
                front: true,
                bump: true,
                reason: "mismatched_sha".to_string(),
            }),
            MergeOutcome::NotMergeable => {
                self.metrics
                    .merges_failed_total
                    .with_label_values(&["not_mergeable"])
                    .inc();
                Ok(RunOutcome::Drop(DropReason::NotMergeable))
            }
            MergeOutcome::Forbidden => {
                self.metrics
                    .merges_failed_total
                    .with_label_values(&["forbidden"])
                    .inc();
                self.apply_backpressure(repo.installation_id, None).await?;
                Ok(RunOutcome::Retry {
                    front: true,
                    bump: true,
                    reason: "forbidden".to_string(),
                })
            }
        }
    }

    fn starved(&self, item: &WorkItem) -> bool {
        if item.starvation_requeued {
            return false;
        }
        (Utc::now() - item.first_seen_at)
            .to_std()
            .is_ok_and(|age| age > self.config.starvation_window)
    }

    async fn classify_api_error(&self, item: &WorkItem, error: ApiError) -> RunOutcome {
        match error {
            ApiError::Throttled { cooldown } => {
                if let Err(e) = self
                    .apply_backpressure(item.installation_id, cooldown)
                    .await
                {
                    warn!("failed to persist throttle for {item}: {e}");
                }
                RunOutcome::Retry {
                    front: true,
                    bump: false,
                    reason: "throttled".to_string(),
                }
            }
            ApiError::Config(message) => {
                warn!("policy for {item} invalid: {message}");
                RunOutcome::Dlq("config_invalid".to_string())
            }
            e @ (ApiError::Transport(_) | ApiError::Status { .. } | ApiError::Parse(_)) => {
                warn!("transient API failure for {item}: {e}");
                RunOutcome::Retry {
                    front: false,
                    bump: true,
                    reason: "transport_error".to_string(),
                }
            }
        }
    }

    /// Compare the facade's quota snapshot against the configured floor and
    /// install an installation-wide cooldown when it is crossed.
    async fn observe_quota(&self, repo: &RepoKey) -> Result<(), QueueError> {
        let rate = self.api.rate_snapshot();
        if let Some(remaining) = rate.remaining
            && remaining <= self.config.rate_limit_min_remaining
            && self
                .store
                .get_throttle(repo.installation_id)
                .await?
                .is_none()
        {
            debug!(
                "quota low for installation {} ({remaining} remaining)",
                repo.installation_id
            );
            self.apply_backpressure(repo.installation_id, None).await?;
        }
        Ok(())
    }

    async fn apply_backpressure(
        &self,
        installation_id: u64,
        hint: Option<Duration>,
    ) -> Result<(), QueueError> {
        let until = self.backpressure_until(&self.api.rate_snapshot(), hint);
        self.store.set_throttle(installation_id, until).await?;
        self.metrics.throttles_total.inc();
        self.metrics
            .backpressure_active
            .with_label_values(&[&installation_id.to_string()])
            .set(1);
        warn!("installation {installation_id} throttled until {until}");
        Ok(())
    }

    fn backpressure_until(
        &self,
        rate: &RateInfo,
        hint: Option<Duration>,
    ) -> chrono::DateTime<Utc> {
        let now = Utc::now();
        let mut until = now + to_delta(self.config.rate_limit_cooldown);
        if let Some(reset_at) = rate.reset_at
            && reset_at > until
        {
            until = reset_at;
        }
        if let Some(hint) = hint {
            let hinted = now + to_delta(hint);
            if hinted > until {
                until = hinted;
            }
        }
        let jitter_secs = self.config.rate_limit_jitter.as_secs();
        if jitter_secs > 0 {
            until += TimeDelta::seconds(rand::rng().random_range(0..=jitter_secs) as i64);
        }
        until.min(now + to_delta(self.config.max_backoff))
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::MockGithubApi;
    use crate::metrics::Metrics;
    use crate::policy::MergeMethod;
    use crate::queue::{MemoryQueueStore, QueueStore};

    fn snapshot() -> PrSnapshot {
        PrSnapshot {
            number: 7,
            state: PrState::Open,
            draft: false,
            locked: false,
            labels: vec!["automerge".to_string()],
            head_sha: "a".repeat(40),
            head_ref: "feature".to_string(),
            base_ref: "main".to_string(),
            mergeable: Some(true),
            mergeable_state: MergeableState::Clean,
            user: "octocat".to_string(),
            title: "Fix it".to_string(),
            body: String::new(),
            behind_by: Some(0),
        }
    }

    #[test]
    fn ineligible_covers_every_gate() {
        let policy = RepoPolicy::default();

        let mut pr = snapshot();
        pr.state = PrState::Closed;
        assert_eq!(Pipeline::ineligible(&pr, &policy), Some(DropReason::Closed));

        let mut pr = snapshot();
        pr.draft = true;
        assert_eq!(Pipeline::ineligible(&pr, &policy), Some(DropReason::Draft));

        let mut pr = snapshot();
        pr.labels.clear();
        assert_eq!(
            Pipeline::ineligible(&pr, &policy),
            Some(DropReason::LabelMissing)
        );

        let mut pr = snapshot();
        pr.mergeable_state = MergeableState::Dirty;
        assert_eq!(
            Pipeline::ineligible(&pr, &policy),
            Some(DropReason::MergeConflict)
        );

        let mut pr = snapshot();
        pr.mergeable_state = MergeableState::Blocked;
        assert_eq!(Pipeline::ineligible(&pr, &policy), Some(DropReason::Blocked));

        assert_eq!(Pipeline::ineligible(&snapshot(), &policy), None);
    }

    #[test]
    fn check_classification() {
        let policy = RepoPolicy::default();
        let success = CombinedStatus {
            state: StatusState::Success,
            total_count: 2,
        };
        let none = CombinedStatus {
            state: StatusState::None,
            total_count: 0,
        };
        let good = CheckSuite {
            status: crate::github::CheckStatus::Completed,
            conclusion: Some(crate::github::CheckConclusion::Success),
        };
        let running = CheckSuite {
            status: crate::github::CheckStatus::InProgress,
            conclusion: None,
        };
        let bad = CheckSuite {
            status: crate::github::CheckStatus::Completed,
            conclusion: Some(crate::github::CheckConclusion::Failure),
        };

        assert!(matches!(
            Pipeline::classify_checks(&success, &[good], &policy),
            ChecksState::Green
        ));
        assert!(matches!(
            Pipeline::classify_checks(&success, &[running], &policy),
            ChecksState::Pending
        ));
        assert!(matches!(
            Pipeline::classify_checks(&success, &[good, bad], &policy),
            ChecksState::Failing
        ));

        // No checks at all: policy decides.
        assert!(matches!(
            Pipeline::classify_checks(&none, &[], &policy),
            ChecksState::Pending
        ));
        let permissive = RepoPolicy {
            allow_merge_when_no_checks: true,
            ..RepoPolicy::default()
        };
        assert!(matches!(
            Pipeline::classify_checks(&none, &[], &permissive),
            ChecksState::Green
        ));
    }

    #[test]
    fn backpressure_window_honors_reset_and_cap() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(MemoryQueueStore::new(metrics.clone()));
        let config = PipelineConfig {
            rate_limit_cooldown: Duration::from_secs(60),
            rate_limit_jitter: Duration::ZERO,
            max_backoff: Duration::from_secs(120),
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(
            Arc::new(MockGithubApi::new()),
            store,
            metrics,
            config,
        );

        let now = Utc::now();
        let rate = RateInfo {
            remaining: Some(10),
            reset_at: Some(now + TimeDelta::seconds(90)),
            retry_after: None,
        };
        let until = pipeline.backpressure_until(&rate, None);
        assert!(until >= now + TimeDelta::seconds(89));
        assert!(until <= now + TimeDelta::seconds(121));

        // A reset far in the future is capped by max_backoff.
        let rate = RateInfo {
            remaining: Some(0),
            reset_at: Some(now + TimeDelta::seconds(3600)),
            retry_after: None,
        };
        let until = pipeline.backpressure_until(&rate, None);
        assert!(until <= now + TimeDelta::seconds(121));
    }

    #[tokio::test]
    async fn broken_policy_file_dead_letters() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(MemoryQueueStore::new(metrics.clone()));

        let mut api = MockGithubApi::new();
        api.expect_get_pr().returning(|_, _| Ok(snapshot()));
        api.expect_load_policy()
            .returning(|_, _| Err(ApiError::Config("expected bool".to_string())));
        api.expect_rate_snapshot().returning(RateInfo::default);

        let item = WorkItem::new(1, "octo", "widgets", 7);
        store.enqueue(&item).await.unwrap();
        let repo = item.repo_key();
        let token = store
            .acquire_lease(&repo, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let popped = store.pop_head(&repo).await.unwrap().unwrap();

        let pipeline = Pipeline::new(
            Arc::new(api),
            store.clone(),
            metrics,
            PipelineConfig::default(),
        );
        let mut heartbeat = Heartbeat::new(
            store.as_ref(),
            &repo,
            &token,
            Duration::from_secs(60),
            Duration::from_secs(15),
        );
        let outcome = pipeline.run(&popped, &mut heartbeat).await;
        assert_eq!(outcome, RunOutcome::Dlq("config_invalid".to_string()));
    }

    #[tokio::test]
    async fn lost_lease_aborts_without_merge() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(MemoryQueueStore::new(metrics.clone()));

        let mut api = MockGithubApi::new();
        api.expect_get_pr().returning(|_, _| Ok(snapshot()));
        api.expect_load_policy()
            .returning(|_, _| Ok(RepoPolicy::default()));
        api.expect_rate_snapshot().returning(RateInfo::default);
        // No merge expectation: calling it would panic the mock.

        let item = WorkItem::new(1, "octo", "widgets", 7);
        let repo = item.repo_key();
        store.enqueue(&item).await.unwrap();
        let popped = store.pop_head(&repo).await.unwrap().unwrap();

        let pipeline = Pipeline::new(
            Arc::new(api),
            store.clone(),
            metrics,
            PipelineConfig::default(),
        );
        // Never-acquired token with a zero refresh interval: the first beat
        // fails and the run must abort before any further phase.
        let mut heartbeat = Heartbeat::new(
            store.as_ref(),
            &repo,
            &LeaseToken::generate(),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        let outcome = pipeline.run(&popped, &mut heartbeat).await;
        assert_eq!(outcome, RunOutcome::LeaseLost);
    }
}
