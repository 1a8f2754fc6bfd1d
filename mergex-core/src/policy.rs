//! Per-repository merge policy.
//!
//! Repositories opt into auto-merging via a flat TOML file committed to the
//! PR's base ref. A missing file means defaults; a file that fails to parse
//! is a configuration error and dead-letters the work item.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Label a PR must carry before the pipeline will touch it.
pub const DEFAULT_LABEL: &str = "automerge";

/// Well-known path of the policy file on the PR's base ref.
pub const POLICY_FILE_PATH: &str = ".mergex.toml";

const DEFAULT_TITLE_TEMPLATE: &str = "{title} (#{number})";
const DEFAULT_BODY_TEMPLATE: &str = "{body}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    #[default]
    Squash,
    Rebase,
    Merge,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
            MergeMethod::Merge => "merge",
        }
    }
}

/// Merge policy for one repository. Unknown keys in the policy file are
/// ignored so repos can carry forward-compatible settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoPolicy {
    pub label: String,
    pub merge_method: MergeMethod,
    pub require_up_to_date: bool,
    pub update_branch: bool,
    pub allow_merge_when_no_checks: bool,
    pub max_wait_minutes: u64,
    pub poll_interval_seconds: u64,
    pub title_template: String,
    pub body_template: String,
}

impl Default for RepoPolicy {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            merge_method: MergeMethod::Squash,
            require_up_to_date: true,
            update_branch: true,
            allow_merge_when_no_checks: false,
            max_wait_minutes: 60,
            poll_interval_seconds: 10,
            title_template: DEFAULT_TITLE_TEMPLATE.to_string(),
            body_template: DEFAULT_BODY_TEMPLATE.to_string(),
        }
    }
}

impl RepoPolicy {
    pub fn parse(content: &str) -> Result<Self, PolicyError> {
        toml::from_str(content).map_err(|e| PolicyError::Invalid(e.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_minutes * 60)
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy file: {0}")]
    Invalid(String),
}

/// Values available to commit title/body templates.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub number: u64,
    pub title: &'a str,
    pub body: &'a str,
    pub head: &'a str,
    pub base: &'a str,
    pub user: &'a str,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template placeholder {{{0}}}")]
    UnknownPlaceholder(String),
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("placeholder regex"));

/// Substitute `{number}`, `{title}`, `{body}`, `{head}`, `{base}` and
/// `{user}` in a template. Any other `{word}` token rejects the whole
/// template so misconfigured repos fail before the merge call.
pub fn render_template(
    template: &str,
    cx: &TemplateContext<'_>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        out.push_str(&template[last..whole.start()]);
        match &caps[1] {
            "number" => out.push_str(&cx.number.to_string()),
            "title" => out.push_str(cx.title),
            "body" => out.push_str(cx.body),
            "head" => out.push_str(cx.head),
            "base" => out.push_str(cx.base),
            "user" => out.push_str(cx.user),
            other => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}
