//! Activity categories and the per-repository fetch seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{DormantError, Result};
use crate::types::Repository;

/// A category of event that counts as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityType {
    Commits,
    Issues,
    IssueComments,
    PrComments,
}

impl ActivityType {
    pub const ALL: [ActivityType; 4] = [
        ActivityType::Commits,
        ActivityType::Issues,
        ActivityType::IssueComments,
        ActivityType::PrComments,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityType::Commits => "commits",
            ActivityType::Issues => "issues",
            ActivityType::IssueComments => "issue-comments",
            ActivityType::PrComments => "pr-comments",
        }
    }

    /// First-page route for this activity in `org/repo` since `since` (ISO 8601).
    pub fn route(self, org: &str, repo: &str, since: &str) -> String {
        let resource = match self {
            ActivityType::Commits => "commits",
            ActivityType::Issues => "issues",
            ActivityType::IssueComments => "issues/comments",
            ActivityType::PrComments => "pulls/comments",
        };
        format!(
            "/repos/{}/{}/{}?per_page=100&since={}",
            org, repo, resource, since
        )
    }

    /// Parse the enabled subset from user-facing tags. Empty input enables everything.
    pub fn parse_set<S: AsRef<str>>(tags: &[S]) -> Result<BTreeSet<ActivityType>> {
        if tags.is_empty() {
            return Ok(ActivityType::ALL.into_iter().collect());
        }
        tags.iter().map(|t| t.as_ref().parse()).collect()
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = DormantError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "commits" => Ok(ActivityType::Commits),
            "issues" => Ok(ActivityType::Issues),
            "issue-comments" => Ok(ActivityType::IssueComments),
            "pr-comments" => Ok(ActivityType::PrComments),
            other => Err(DormantError::ConfigError(format!(
                "Unknown activity type '{}', expected one of: commits, issues, issue-comments, pr-comments",
                other
            ))),
        }
    }
}

/// Actor logins from one fetch. `gap` describes pages that could not be
/// read, in which case `logins` is partial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorLogins {
    pub logins: Vec<String>,
    pub gap: Option<String>,
}

impl ActorLogins {
    pub fn new(logins: Vec<String>) -> Self {
        Self { logins, gap: None }
    }

    pub fn with_gap(mut self, gap: Option<String>) -> Self {
        self.gap = gap;
        self
    }
}

/// Fetches the actor logins of one activity type in one repository.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn actor_logins(
        &self,
        activity: ActivityType,
        org: &str,
        repo: &Repository,
        since: &str,
    ) -> Result<ActorLogins>;
}
