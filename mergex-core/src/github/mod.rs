//! Typed facade over the hosting platform's API.
//!
//! The pipeline only ever sees the types in this module; transport, auth,
//! and per-call retry discipline live in [`client`]. Idempotent operations
//! may be retried inside the facade; `merge_pr` is never retried here —
//! merge failures propagate so the pipeline can decide.

mod client;

pub use client::{GithubClient, GithubClientConfig};

use crate::model::RepoKey;
use crate::policy::{MergeMethod, RepoPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
}

/// The platform's composite judgment on whether a merge would succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeableState {
    Clean,
    Behind,
    Dirty,
    Blocked,
    Unstable,
    #[serde(other)]
    Unknown,
}

/// Point-in-time view of a pull request.
#[derive(Debug, Clone)]
pub struct PrSnapshot {
    pub number: u64,
    pub state: PrState,
    pub draft: bool,
    pub locked: bool,
    pub labels: Vec<String>,
    pub head_sha: String,
    pub head_ref: String,
    pub base_ref: String,
    pub mergeable: Option<bool>,
    pub mergeable_state: MergeableState,
    pub user: String,
    pub title: String,
    pub body: String,
    pub behind_by: Option<u64>,
}

impl PrSnapshot {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(name))
    }

    /// Whether the head needs a base merge before the PR is up to date.
    pub fn is_behind(&self) -> bool {
        self.behind_by.is_some_and(|n| n > 0) || self.mergeable_state == MergeableState::Behind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Success,
    Pending,
    Failure,
    /// The commit has no statuses at all.
    None,
}

#[derive(Debug, Clone)]
pub struct CombinedStatus {
    pub state: StatusState,
    pub total_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    TimedOut,
    ActionRequired,
    Stale,
    Skipped,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct CheckSuite {
    pub status: CheckStatus,
    pub conclusion: Option<CheckConclusion>,
}

impl CheckSuite {
    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Completed
            && matches!(
                self.conclusion,
                Some(
                    CheckConclusion::Success
                        | CheckConclusion::Neutral
                        | CheckConclusion::Skipped
                )
            )
    }

    pub fn failed(&self) -> bool {
        self.status == CheckStatus::Completed && !self.passed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateBranchOutcome {
    Ok,
    NotBehind,
    Conflict,
}

impl UpdateBranchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateBranchOutcome::Ok => "ok",
            UpdateBranchOutcome::NotBehind => "not_behind",
            UpdateBranchOutcome::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    NotMergeable,
    MismatchedSha,
    Forbidden,
}

/// Quota snapshot surfaced after every facade call.
#[derive(Debug, Clone, Default)]
pub struct RateInfo {
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Network failures and 5xx responses, surfaced after the facade's own
    /// retry budget is spent.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    /// 429 or a secondary 403 carrying a quota signal.
    #[error("throttled by remote API")]
    Throttled { cooldown: Option<Duration> },

    /// The repo's policy file exists but cannot be parsed.
    #[error("invalid repo policy: {0}")]
    Config(String),

    #[error("malformed response: {0}")]
    Parse(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GithubApi: Send + Sync {
    async fn get_pr(&self, repo: &RepoKey, number: u64) -> Result<PrSnapshot, ApiError>;

    async fn get_combined_status(
        &self,
        repo: &RepoKey,
        sha: &str,
    ) -> Result<CombinedStatus, ApiError>;

    async fn get_check_suites(
        &self,
        repo: &RepoKey,
        sha: &str,
    ) -> Result<Vec<CheckSuite>, ApiError>;

    /// Policy file from the given ref; a missing file yields defaults, a
    /// present-but-broken file yields [`ApiError::Config`].
    async fn load_policy(&self, repo: &RepoKey, git_ref: &str) -> Result<RepoPolicy, ApiError>;

    async fn update_branch(
        &self,
        repo: &RepoKey,
        number: u64,
    ) -> Result<UpdateBranchOutcome, ApiError>;

    /// Non-idempotent; the facade never retries this.
    #[allow(clippy::too_many_arguments)]
    async fn merge_pr(
        &self,
        repo: &RepoKey,
        number: u64,
        head_sha: &str,
        method: MergeMethod,
        title: &str,
        body: &str,
    ) -> Result<MergeOutcome, ApiError>;

    /// Last-observed quota, updated after every call.
    fn rate_snapshot(&self) -> RateInfo;

    /// Cheap authenticated probe for readiness checks.
    async fn ping(&self) -> Result<(), ApiError>;
}
