use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coordinates of a repository within an installation.
///
/// Every queue, lease, and dead-letter list is keyed by this triple; work for
/// different repos never shares ordering or locking state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoKey {
    pub installation_id: u64,
    pub owner: String,
    pub repo: String,
}

impl RepoKey {
    pub fn new(installation_id: u64, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            installation_id,
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// `owner/repo` without the installation prefix, for log lines.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.installation_id, self.owner, self.repo)
    }
}

impl FromStr for RepoKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        let installation_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("invalid repo key: {s}"))?;
        let owner = parts.next().ok_or_else(|| format!("invalid repo key: {s}"))?;
        let repo = parts.next().ok_or_else(|| format!("invalid repo key: {s}"))?;
        if owner.is_empty() || repo.is_empty() {
            return Err(format!("invalid repo key: {s}"));
        }
        Ok(Self::new(installation_id, owner, repo))
    }
}

/// A scheduled attempt to merge a specific pull request.
///
/// Work items are stored as JSON documents in the durable queue. The dedup
/// key collapses redundant enqueues: at any instant at most one item per
/// `(installation, owner, repo, pr)` exists across the pending list and the
/// in-flight slot combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub installation_id: u64,
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    /// Set on first enqueue and preserved across every retry.
    pub enqueued_at: DateTime<Utc>,
    /// Reset by a starvation requeue; bounds how long one item may occupy
    /// the head of its repo queue.
    pub first_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub starvation_requeued: bool,
}

impl WorkItem {
    pub fn new(
        installation_id: u64,
        owner: impl Into<String>,
        repo: impl Into<String>,
        pr_number: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            installation_id,
            owner: owner.into(),
            repo: repo.into(),
            pr_number,
            enqueued_at: now,
            first_seen_at: now,
            attempt: 0,
            starvation_requeued: false,
        }
    }

    pub fn repo_key(&self) -> RepoKey {
        RepoKey::new(self.installation_id, self.owner.clone(), self.repo.clone())
    }

    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}/{}#{}",
            self.installation_id, self.owner, self.repo, self.pr_number
        )
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{} (attempt {})",
            self.owner, self.repo, self.pr_number, self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_format() {
        let item = WorkItem::new(42, "octo", "widgets", 7);
        assert_eq!(item.dedup_key(), "42:octo/widgets#7");
    }

    #[test]
    fn repo_key_roundtrip() {
        let key = RepoKey::new(42, "octo", "widgets");
        let parsed: RepoKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn repo_key_rejects_garbage() {
        assert!("not-a-key".parse::<RepoKey>().is_err());
        assert!("12/only-owner".parse::<RepoKey>().is_err());
        assert!("x/o/r".parse::<RepoKey>().is_err());
    }

    #[test]
    fn work_item_survives_json() {
        let item = WorkItem::new(1, "a", "b", 3);
        let json = serde_json::to_string(&item).unwrap();
        let back: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }
}
