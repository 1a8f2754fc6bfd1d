use super::{
    ApiError, CheckConclusion, CheckStatus, CheckSuite, CombinedStatus, GithubApi,
    MergeOutcome, MergeableState, PrSnapshot, PrState, RateInfo, StatusState,
    UpdateBranchOutcome,
};
use crate::metrics::Metrics;
use crate::model::RepoKey;
use crate::policy::{MergeMethod, RepoPolicy, POLICY_FILE_PATH};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_RAW: &str = "application/vnd.github.raw";

#[derive(Debug, Clone)]
pub struct GithubClientConfig {
    pub base_url: String,
    pub token: String,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
}

impl Default for GithubClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: String::new(),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-local API client. The HTTP pool and the quota cell are shared by
/// every worker; the quota cell is the only mutable state and sits behind a
/// mutex.
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    config: GithubClientConfig,
    rate: Mutex<RateInfo>,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

impl GithubClient {
    pub fn new(config: GithubClientConfig, metrics: Arc<Metrics>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("mergex/", env!("CARGO_PKG_VERSION"))),
        );
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|e| ApiError::Transport(format!("invalid API token: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
            rate: Mutex::new(RateInfo::default()),
            metrics,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Record the quota headers the platform attaches to every response.
    fn note_rate(&self, response: &Response) {
        let headers = response.headers();
        let remaining = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let reset_at = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        let retry_after = headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        if let Some(remaining) = remaining {
            self.metrics.github_rate_limit_remaining.set(remaining as i64);
        }
        if let Some(reset_at) = reset_at {
            self.metrics.github_rate_limit_reset.set(reset_at.timestamp());
        }

        let mut rate = self.rate.lock();
        if remaining.is_some() {
            rate.remaining = remaining;
        }
        if reset_at.is_some() {
            rate.reset_at = reset_at;
        }
        rate.retry_after = retry_after;
    }

    fn throttle_error(&self, response: &Response) -> Option<ApiError> {
        let status = response.status();
        let exhausted = {
            let rate = self.rate.lock();
            rate.remaining == Some(0) || rate.retry_after.is_some()
        };
        if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN && exhausted)
        {
            let cooldown = self.rate.lock().retry_after;
            return Some(ApiError::Throttled { cooldown });
        }
        None
    }

    /// Send a request, retrying transport errors, 5xx, and throttles with
    /// exponential backoff when the operation is idempotent. Non-idempotent
    /// calls go out exactly once.
    async fn send(
        &self,
        method: &'static str,
        request: reqwest::RequestBuilder,
        idempotent: bool,
    ) -> Result<Response, ApiError> {
        let mut attempt = 0u32;
        loop {
            let cloned = request
                .try_clone()
                .ok_or_else(|| ApiError::Transport("request body not replayable".into()))?;

            self.metrics
                .github_api_requests_total
                .with_label_values(&[method])
                .inc();
            let timer = self
                .metrics
                .github_api_latency_seconds
                .with_label_values(&[method])
                .start_timer();
            let result = cloned.send().await;
            timer.observe_duration();

            let retryable = match result {
                Ok(response) => {
                    self.note_rate(&response);
                    if let Some(throttled) = self.throttle_error(&response) {
                        if !idempotent || attempt >= self.config.max_retries {
                            return Err(throttled);
                        }
                        true
                    } else if response.status().is_server_error() {
                        if !idempotent || attempt >= self.config.max_retries {
                            return Err(ApiError::Status {
                                status: response.status().as_u16(),
                                message: "server error".to_string(),
                            });
                        }
                        true
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) => {
                    if !idempotent || attempt >= self.config.max_retries {
                        return Err(ApiError::Transport(e.to_string()));
                    }
                    true
                }
            };

            if retryable {
                let mut delay =
                    backoff_delay(self.config.backoff_base, attempt, self.config.backoff_max);
                if let Some(hint) = self.rate.lock().retry_after {
                    delay = delay.max(hint).min(self.config.backoff_max);
                }
                debug!("retrying {method} after {delay:?} (attempt {attempt})");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }

    async fn status_error(response: Response) -> ApiError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        ApiError::Status {
            status,
            message: message.chars().take(200).collect(),
        }
    }

    async fn fetch_behind_by(
        &self,
        repo: &RepoKey,
        base_ref: &str,
        head_sha: &str,
    ) -> Result<Option<u64>, ApiError> {
        let url = self.url(&format!(
            "/repos/{}/{}/compare/{base_ref}...{head_sha}",
            repo.owner, repo.repo
        ));
        let response = self.send("compare", self.http.get(url), true).await?;
        if !response.status().is_success() {
            warn!(
                "compare for {repo} returned {}; treating behind_by as unknown",
                response.status()
            );
            return Ok(None);
        }
        let wire: CompareWire = Self::parse_json(response).await?;
        Ok(Some(wire.behind_by))
    }
}

#[derive(Deserialize)]
struct LabelWire {
    name: String,
}

#[derive(Deserialize)]
struct GitRefWire {
    sha: String,
    #[serde(rename = "ref")]
    git_ref: String,
}

#[derive(Deserialize)]
struct UserWire {
    login: String,
}

#[derive(Deserialize)]
struct PrWire {
    number: u64,
    state: PrState,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    labels: Vec<LabelWire>,
    head: GitRefWire,
    base: GitRefWire,
    mergeable: Option<bool>,
    mergeable_state: Option<MergeableState>,
    user: Option<UserWire>,
    title: String,
    body: Option<String>,
    behind_by: Option<u64>,
}

#[derive(Deserialize)]
struct CompareWire {
    behind_by: u64,
}

#[derive(Deserialize)]
struct CombinedStatusWire {
    state: String,
    total_count: u64,
}

#[derive(Deserialize)]
struct CheckSuiteWire {
    status: CheckStatus,
    conclusion: Option<CheckConclusion>,
}

#[derive(Deserialize)]
struct CheckSuitesWire {
    check_suites: Vec<CheckSuiteWire>,
}

#[derive(Deserialize)]
struct MessageWire {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl GithubApi for GithubClient {
    async fn get_pr(&self, repo: &RepoKey, number: u64) -> Result<PrSnapshot, ApiError> {
        let url = self.url(&format!("/repos/{}/{}/pulls/{number}", repo.owner, repo.repo));
        let response = self.send("get_pr", self.http.get(url), true).await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let wire: PrWire = Self::parse_json(response).await?;

        let mergeable_state = wire.mergeable_state.unwrap_or(MergeableState::Unknown);
        let behind_by = match wire.behind_by {
            Some(n) => Some(n),
            // The platform omits behind_by on the PR document; derive it
            // from a compare call only when the PR is actually behind.
            None if mergeable_state == MergeableState::Behind => {
                self.fetch_behind_by(repo, &wire.base.git_ref, &wire.head.sha)
                    .await?
            }
            None => None,
        };

        Ok(PrSnapshot {
            number: wire.number,
            state: wire.state,
            draft: wire.draft,
            locked: wire.locked,
            labels: wire.labels.into_iter().map(|l| l.name).collect(),
            head_sha: wire.head.sha,
            head_ref: wire.head.git_ref,
            base_ref: wire.base.git_ref,
            mergeable: wire.mergeable,
            mergeable_state,
            user: wire.user.map(|u| u.login).unwrap_or_default(),
            title: wire.title,
            body: wire.body.unwrap_or_default(),
            behind_by,
        })
    }

    async fn get_combined_status(
        &self,
        repo: &RepoKey,
        sha: &str,
    ) -> Result<CombinedStatus, ApiError> {
        let url = self.url(&format!(
            "/repos/{}/{}/commits/{sha}/status",
            repo.owner, repo.repo
        ));
        let response = self.send("combined_status", self.http.get(url), true).await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let wire: CombinedStatusWire = Self::parse_json(response).await?;
        let state = if wire.total_count == 0 {
            StatusState::None
        } else {
            match wire.state.as_str() {
                "success" => StatusState::Success,
                "failure" | "error" => StatusState::Failure,
                _ => StatusState::Pending,
            }
        };
        Ok(CombinedStatus {
            state,
            total_count: wire.total_count,
        })
    }

    async fn get_check_suites(
        &self,
        repo: &RepoKey,
        sha: &str,
    ) -> Result<Vec<CheckSuite>, ApiError> {
        let url = self.url(&format!(
            "/repos/{}/{}/commits/{sha}/check-suites",
            repo.owner, repo.repo
        ));
        let response = self.send("check_suites", self.http.get(url), true).await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let wire: CheckSuitesWire = Self::parse_json(response).await?;
        Ok(wire
            .check_suites
            .into_iter()
            .map(|s| CheckSuite {
                status: s.status,
                conclusion: s.conclusion,
            })
            .collect())
    }

    async fn load_policy(&self, repo: &RepoKey, git_ref: &str) -> Result<RepoPolicy, ApiError> {
        let url = self.url(&format!(
            "/repos/{}/{}/contents/{POLICY_FILE_PATH}",
            repo.owner, repo.repo
        ));
        let request = self
            .http
            .get(url)
            .query(&[("ref", git_ref)])
            .header(ACCEPT, ACCEPT_RAW);
        let response = self.send("load_policy", request, true).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("no policy file on {repo}@{git_ref}; using defaults");
            return Ok(RepoPolicy::default());
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let content = response
            .text()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        RepoPolicy::parse(&content).map_err(|e| ApiError::Config(e.to_string()))
    }

    async fn update_branch(
        &self,
        repo: &RepoKey,
        number: u64,
    ) -> Result<UpdateBranchOutcome, ApiError> {
        let url = self.url(&format!(
            "/repos/{}/{}/pulls/{number}/update-branch",
            repo.owner, repo.repo
        ));
        let response = self
            .send("update_branch", self.http.put(url).json(&json!({})), true)
            .await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(UpdateBranchOutcome::Ok),
            StatusCode::UNPROCESSABLE_ENTITY => {
                let wire: MessageWire = Self::parse_json(response).await.unwrap_or(MessageWire {
                    message: String::new(),
                });
                let message = wire.message.to_ascii_lowercase();
                if message.contains("up to date") || message.contains("not behind") {
                    Ok(UpdateBranchOutcome::NotBehind)
                } else {
                    Ok(UpdateBranchOutcome::Conflict)
                }
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn merge_pr(
        &self,
        repo: &RepoKey,
        number: u64,
        head_sha: &str,
        method: MergeMethod,
        title: &str,
        body: &str,
    ) -> Result<MergeOutcome, ApiError> {
        let url = self.url(&format!(
            "/repos/{}/{}/pulls/{number}/merge",
            repo.owner, repo.repo
        ));
        let request = self.http.put(url).json(&json!({
            "commit_title": title,
            "commit_message": body,
            "sha": head_sha,
            "merge_method": method.as_str(),
        }));
        let response = self.send("merge", request, false).await?;
        match response.status() {
            StatusCode::OK => Ok(MergeOutcome::Merged),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::UNPROCESSABLE_ENTITY => {
                Ok(MergeOutcome::NotMergeable)
            }
            StatusCode::CONFLICT => Ok(MergeOutcome::MismatchedSha),
            StatusCode::FORBIDDEN => Ok(MergeOutcome::Forbidden),
            _ => Err(Self::status_error(response).await),
        }
    }

    fn rate_snapshot(&self) -> RateInfo {
        self.rate.lock().clone()
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let url = self.url("/rate_limit");
        let response = self.send("rate_limit", self.http.get(url), true).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, 0, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 20, max), max);
    }

    #[test]
    fn mergeable_state_parses_unknown_values() {
        let state: MergeableState = serde_json::from_str("\"has_hooks\"").unwrap();
        assert_eq!(state, MergeableState::Unknown);
        let state: MergeableState = serde_json::from_str("\"blocked\"").unwrap();
        assert_eq!(state, MergeableState::Blocked);
    }

    #[test]
    fn pr_wire_maps_to_snapshot_fields() {
        let json = serde_json::json!({
            "number": 7,
            "state": "open",
            "draft": false,
            "locked": false,
            "labels": [{"name": "automerge"}],
            "head": {"sha": "a".repeat(40), "ref": "feature"},
            "base": {"sha": "b".repeat(40), "ref": "main"},
            "mergeable": true,
            "mergeable_state": "clean",
            "user": {"login": "octocat"},
            "title": "Fix it",
            "body": null
        });
        let wire: PrWire = serde_json::from_value(json).unwrap();
        assert_eq!(wire.number, 7);
        assert_eq!(wire.head.git_ref, "feature");
        assert!(wire.body.is_none());
        assert_eq!(wire.mergeable_state, Some(MergeableState::Clean));
    }
}
