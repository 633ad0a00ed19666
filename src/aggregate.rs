//! Attribution of repository activity to organization members.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::activity::{ActivitySource, ActivityType};
use crate::error::{DormantError, Result};
use crate::pool::run_pool;
use crate::progress::{emit, ProgressCallback, ProgressEvent};
use crate::types::{Repository, User};

/// Login → user lookup built once per run.
///
/// The map itself is never modified after construction; each user sits
/// behind its own lock so workers touching different users never contend.
pub struct UserIndex {
    users: HashMap<String, Mutex<User>>,
}

impl UserIndex {
    pub fn new(users: Vec<User>) -> Self {
        let users = users
            .into_iter()
            .map(|user| (user.login.clone(), Mutex::new(user)))
            .collect();
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Mark `login` active for `activity`. Returns `false` for non-members.
    pub fn record(&self, login: &str, activity: ActivityType) -> bool {
        match self.users.get(login) {
            Some(slot) => {
                slot.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .mark_active(activity);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, login: &str) -> Option<User> {
        self.users
            .get(login)
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    /// Users sorted by login.
    pub fn snapshot(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .values()
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect();
        users.sort_by(|a, b| a.login.cmp(&b.login));
        users
    }

    /// Users sorted by login.
    pub fn into_users(self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .into_values()
            .map(|slot| slot.into_inner().unwrap_or_else(|e| e.into_inner()))
            .collect();
        users.sort_by(|a, b| a.login.cmp(&b.login));
        users
    }
}

/// A (repository, activity type) pair whose fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFetch {
    pub repository: String,
    pub activity: ActivityType,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    /// Every member, sorted by login.
    pub users: Vec<User>,
    pub skipped: Vec<SkippedFetch>,
}

pub struct ActivityAggregator {
    source: Arc<dyn ActivitySource>,
    workers: usize,
    on_progress: Option<ProgressCallback>,
}

impl ActivityAggregator {
    pub fn new(source: Arc<dyn ActivitySource>, workers: usize) -> Self {
        Self {
            source,
            workers,
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, on_progress: Option<ProgressCallback>) -> Self {
        self.on_progress = on_progress;
        self
    }

    /// Fetch every enabled activity type for every repository and mark the
    /// members who show up as actors.
    ///
    /// Individual fetch failures are collected as skips. Only cancellation
    /// fails the whole run.
    pub async fn run(
        &self,
        org: &str,
        users: Vec<User>,
        repositories: Vec<Repository>,
        since: &str,
        enabled: &BTreeSet<ActivityType>,
    ) -> Result<AggregationOutcome> {
        let index = Arc::new(UserIndex::new(users));
        let activities: Arc<[ActivityType]> = enabled.iter().copied().collect();
        let total = repositories.len() * activities.len();

        info!(
            "Scanning {} repositories of {} for {} activity types ({} fetches)",
            repositories.len(),
            org,
            activities.len(),
            total
        );
        emit(self.on_progress.as_ref(), ProgressEvent::Started { total });

        let completed = Arc::new(AtomicUsize::new(0));
        let results = {
            let source = Arc::clone(&self.source);
            let index = Arc::clone(&index);
            let org: Arc<str> = Arc::from(org);
            let since: Arc<str> = Arc::from(since);
            let on_progress = self.on_progress.clone();
            let completed = Arc::clone(&completed);

            run_pool(repositories, self.workers, move |repo: Repository| {
                let source = Arc::clone(&source);
                let index = Arc::clone(&index);
                let activities = Arc::clone(&activities);
                let org = Arc::clone(&org);
                let since = Arc::clone(&since);
                let on_progress = on_progress.clone();
                let completed = Arc::clone(&completed);

                async move {
                    let mut skipped = Vec::new();
                    for &activity in activities.iter() {
                        match source.actor_logins(activity, &org, &repo, &since).await {
                            Ok(found) => {
                                let matched = found
                                    .logins
                                    .iter()
                                    .filter(|login| index.record(login, activity))
                                    .count();
                                debug!(
                                    "{}/{}: {} {} events, {} by members",
                                    org,
                                    repo.name,
                                    found.logins.len(),
                                    activity,
                                    matched
                                );
                                if let Some(gap) = found.gap {
                                    warn!("Partial {} for {}/{}: {}", activity, org, repo.name, gap);
                                    skipped.push(SkippedFetch {
                                        repository: repo.name.clone(),
                                        activity,
                                        reason: gap,
                                    });
                                }
                            }
                            Err(DormantError::Cancelled) => return Err(DormantError::Cancelled),
                            Err(e) => {
                                warn!("Skipping {} for {}/{}: {}", activity, org, repo.name, e);
                                skipped.push(SkippedFetch {
                                    repository: repo.name.clone(),
                                    activity,
                                    reason: e.to_string(),
                                });
                            }
                        }

                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        emit(
                            on_progress.as_ref(),
                            ProgressEvent::Advanced {
                                repository: repo.name.clone(),
                                activity,
                                completed: done,
                                total,
                            },
                        );
                    }
                    Ok(skipped)
                }
            })
            .await
        };

        let mut skipped = Vec::new();
        for result in results {
            skipped.extend(result?);
        }
        skipped.sort_by(|a, b| (&a.repository, a.activity).cmp(&(&b.repository, b.activity)));

        emit(
            self.on_progress.as_ref(),
            ProgressEvent::Finished {
                completed: completed.load(Ordering::SeqCst),
                skipped: skipped.len(),
            },
        );

        let users = match Arc::try_unwrap(index) {
            Ok(index) => index.into_users(),
            Err(shared) => shared.snapshot(),
        };

        let active = users.iter().filter(|u| u.is_active()).count();
        info!(
            "{} of {} members of {} are active ({} fetches skipped)",
            active,
            users.len(),
            org,
            skipped.len()
        );

        Ok(AggregationOutcome { users, skipped })
    }
}
