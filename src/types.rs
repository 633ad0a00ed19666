use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::activity::ActivityType;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
}

impl Repository {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Organization member as returned by `/orgs/{org}/members`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgMember {
    pub login: String,
    pub id: u64,
}

/// Public profile from `/users/{login}`, used only for the email lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub login: String,
    pub id: u64,
    pub email: Option<String>,
}

/// An organization member together with the activity attributed to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    pub id: u64,
    pub email: Option<String>,
    pub activity_types: BTreeSet<ActivityType>,
}

impl User {
    pub fn new(login: impl Into<String>, id: u64) -> Self {
        Self {
            login: login.into(),
            id,
            email: None,
            activity_types: BTreeSet::new(),
        }
    }

    /// A user is active exactly when some activity type was recorded.
    pub fn is_active(&self) -> bool {
        !self.activity_types.is_empty()
    }

    pub fn mark_active(&mut self, activity: ActivityType) {
        self.activity_types.insert(activity);
    }
}

impl From<OrgMember> for User {
    fn from(member: OrgMember) -> Self {
        User::new(member.login, member.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub login: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    #[serde(default)]
    pub sha: String,
    /// `None` when the commit email is not linked to an account.
    pub author: Option<Actor>,
    pub commit: CommitDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitDetail {
    pub author: Option<CommitSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSignature {
    pub name: Option<String>,
    pub email: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    pub user: Option<Actor>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    pub user: Option<Actor>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestComment {
    pub id: u64,
    pub user: Option<Actor>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Common view over the four event payloads.
pub trait ActivityEvent: DeserializeOwned + Send + 'static {
    fn actor_login(&self) -> Option<&str>;
    fn occurred_at(&self) -> Option<DateTime<Utc>>;
}

impl ActivityEvent for Commit {
    fn actor_login(&self) -> Option<&str> {
        self.author.as_ref().map(|a| a.login.as_str())
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.commit.author.as_ref().and_then(|a| a.date)
    }
}

impl ActivityEvent for Issue {
    fn actor_login(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.login.as_str())
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

impl ActivityEvent for IssueComment {
    fn actor_login(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.login.as_str())
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}

impl ActivityEvent for PullRequestComment {
    fn actor_login(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.login.as_str())
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}
