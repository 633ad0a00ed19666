use std::sync::Arc;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use octocrab::Octocrab;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::Duration;

use crate::activity::{ActivitySource, ActivityType, ActorLogins};
use crate::config::{FetchConfig, GitHubConfig};
use crate::error::{DormantError, Result};
use crate::http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::limiter::{QuotaSnapshot, RequestGovernor};
use crate::pagination::PageWalk;
use crate::pool::run_pool;
use crate::types::{
    ActivityEvent, Commit, Issue, IssueComment, OrgMember, PullRequestComment, Repository, User,
    UserProfile,
};

/// Source of the account's core quota, consulted once before a run.
#[async_trait]
pub trait QuotaProbe: Send + Sync {
    async fn core_quota(&self) -> Result<QuotaSnapshot>;
}

#[async_trait]
impl QuotaProbe for Octocrab {
    async fn core_quota(&self) -> Result<QuotaSnapshot> {
        let rate_limit = self.ratelimit().get().await?;
        let core = &rate_limit.resources.core;

        Ok(QuotaSnapshot {
            limit: u32::try_from(core.limit).unwrap_or(u32::MAX),
            remaining: u32::try_from(core.remaining).unwrap_or(u32::MAX),
            reset_at: DateTime::from_timestamp(core.reset as i64, 0).unwrap_or_else(Utc::now),
        })
    }
}

/// Build the octocrab client used for the quota probe.
pub fn build_octocrab(config: &GitHubConfig, token: String) -> Result<Octocrab> {
    let mut builder = Octocrab::builder().personal_token(token);

    if !config.api_base_url.is_empty() && config.api_base_url != "https://api.github.com" {
        builder = builder
            .base_uri(&config.api_base_url)
            .map_err(|e| DormantError::ConfigError(format!("Invalid base URI: {}", e)))?;
    }

    Ok(builder.build()?)
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// REST client where every request passes the shared [`RequestGovernor`].
#[derive(Clone)]
pub struct GitHubClient {
    transport: Arc<dyn HttpTransport>,
    governor: Arc<RequestGovernor>,
    probe: Option<Arc<dyn QuotaProbe>>,
    config: FetchConfig,
}

impl GitHubClient {
    pub fn new() -> Result<Self> {
        Self::with_config(FetchConfig::default())
    }

    /// Authenticate with the token named by `config.github.token_env_var`.
    pub fn with_config(config: FetchConfig) -> Result<Self> {
        let token = config.github.token()?;
        Self::with_token(config, token)
    }

    pub fn with_token(config: FetchConfig, token: String) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.github, &token)?;
        let octocrab = build_octocrab(&config.github, token)?;

        let mut client = Self::with_transport(Arc::new(transport), config);
        client.probe = Some(Arc::new(octocrab));
        Ok(client)
    }

    /// Client over an arbitrary transport; no quota probe is attached.
    pub fn with_transport(transport: Arc<dyn HttpTransport>, config: FetchConfig) -> Self {
        let governor = Arc::new(RequestGovernor::new(config.rate_limiting.clone()));
        Self {
            transport,
            governor,
            probe: None,
            config,
        }
    }

    pub fn with_quota_probe(mut self, probe: Arc<dyn QuotaProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn governor(&self) -> &Arc<RequestGovernor> {
        &self.governor
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Routes starting with `/` are joined to the API base; full URLs pass through.
    pub fn resolve_url(&self, route: &str) -> String {
        if route.starts_with("http://") || route.starts_with("https://") {
            route.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.github.api_base_url.trim_end_matches('/'),
                route.trim_start_matches('/')
            )
        }
    }

    /// Seed the governor from the quota probe. Failures fall back to the
    /// configured hourly default.
    pub async fn preflight(&self) {
        if !self.config.rate_limiting.preflight_probe {
            return;
        }
        let Some(probe) = &self.probe else {
            debug!(
                "No quota probe configured, assuming {} requests/hour",
                self.config.rate_limiting.default_hourly_limit
            );
            return;
        };

        match probe.core_quota().await {
            Ok(quota) => self.governor.seed(quota),
            Err(e) => warn!(
                "Rate limit probe failed, assuming {} requests/hour: {}",
                self.config.rate_limiting.default_hourly_limit, e
            ),
        }
    }

    /// Governed request with retries for server and transport failures.
    pub async fn send(&self, method: HttpMethod, route: &str) -> Result<HttpResponse> {
        let url = self.resolve_url(route);

        (|| self.send_once(method, &url))
            .retry(self.retry_backoff())
            .notify(|err, delay| {
                warn!(
                    "{} {} failed, retrying in {:?}: {}",
                    method.as_str(),
                    url,
                    delay,
                    err
                );
            })
            .when(DormantError::is_retryable)
            .await
    }

    fn retry_backoff(&self) -> ExponentialBuilder {
        let limits = &self.config.rate_limiting;
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(limits.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(limits.max_backoff_ms))
            .with_max_times(limits.max_attempts.saturating_sub(1))
            .with_jitter()
    }

    /// One logical attempt. Throttled responses are retried here after the
    /// governor's backoff, bounded by `max_attempts`.
    async fn send_once(&self, method: HttpMethod, url: &str) -> Result<HttpResponse> {
        let mut throttled = 0;

        loop {
            let permit = self.governor.acquire().await?;
            let request = HttpRequest {
                method,
                url: url.to_string(),
                body: None,
            };
            let response = match self.transport.request(request).await {
                Ok(response) => response,
                Err(e) => {
                    permit.release();
                    return Err(e);
                }
            };

            self.governor.update_from_headers(&response.headers);
            let rejected = matches!(response.status, 403 | 429);
            let backed_off = self
                .governor
                .release_and_backoff(permit, &response.headers)
                .await;

            if rejected && backed_off {
                throttled += 1;
                if throttled >= self.config.rate_limiting.max_attempts {
                    return Err(DormantError::RateLimitExceeded(url.to_string()));
                }
                debug!("{} {} throttled ({} so far)", method.as_str(), url, throttled);
                continue;
            }

            return check_status(url, response);
        }
    }

    pub async fn list_members(&self, org: &str) -> Result<Vec<User>> {
        info!("Collecting members of {}", org);

        let members = self
            .fetch_all_pages::<OrgMember>(&format!("/orgs/{}/members?per_page=100", org))
            .await?;
        if let Some(gap) = members.gap() {
            warn!("Member list of {} is incomplete: {}", org, gap);
        }

        let mut users: Vec<User> = members.items.into_iter().map(User::from).collect();
        users.sort_by(|a, b| a.login.cmp(&b.login));
        users.dedup_by(|a, b| a.login == b.login);

        info!("Collected {} members of {}", users.len(), org);
        Ok(users)
    }

    pub async fn list_repositories(&self, org: &str) -> Result<Vec<Repository>> {
        info!("Collecting repositories of {}", org);

        #[derive(Deserialize)]
        struct RepoEntry {
            name: String,
        }

        let entries = self
            .fetch_all_pages::<RepoEntry>(&format!("/orgs/{}/repos?per_page=100", org))
            .await?;
        if let Some(gap) = entries.gap() {
            warn!("Repository list of {} is incomplete: {}", org, gap);
        }

        let mut repos: Vec<Repository> = entries.items.into_iter().map(|r| Repository::new(r.name)).collect();
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        repos.dedup();

        info!("Collected {} repositories of {}", repos.len(), org);
        Ok(repos)
    }

    pub async fn fetch_user(&self, login: &str) -> Result<UserProfile> {
        let url = self.resolve_url(&format!("/users/{}", login));
        let response = self.send(HttpMethod::Get, &url).await?;
        decode_body(&url, &response)
    }

    /// Fill in public profile emails. Lookups that fail leave the email unset.
    pub async fn fetch_emails(&self, users: &mut [User]) {
        info!("Fetching emails for {} users", users.len());

        let jobs: Vec<(usize, String)> = users
            .iter()
            .enumerate()
            .map(|(i, u)| (i, u.login.clone()))
            .collect();
        let client = self.clone();
        let results = run_pool(jobs, self.config.concurrency.email_workers, move |(index, login)| {
            let client = client.clone();
            async move {
                let result = client.fetch_user(&login).await;
                (index, login, result)
            }
        })
        .await;

        let mut found = 0;
        for (index, login, result) in results {
            match result {
                Ok(profile) => {
                    if let Some(email) = profile.email.filter(|e| !e.is_empty()) {
                        users[index].email = Some(email);
                        found += 1;
                    }
                }
                Err(e) => warn!("Failed to fetch profile of {}: {}", login, e),
            }
        }

        info!("Found public emails for {} of {} users", found, users.len());
    }

    /// Every event of one kind in `org/repo` since `since`.
    pub async fn fetch_events<E: ActivityEvent>(
        &self,
        activity: ActivityType,
        org: &str,
        repo: &Repository,
        since: &str,
    ) -> Result<PageWalk<E>> {
        debug!("Fetching {} for {}/{}", activity, org, repo.name);
        self.fetch_all_pages(&activity.route(org, &repo.name, since))
            .await
    }
}

#[async_trait]
impl ActivitySource for GitHubClient {
    async fn actor_logins(
        &self,
        activity: ActivityType,
        org: &str,
        repo: &Repository,
        since: &str,
    ) -> Result<ActorLogins> {
        match activity {
            ActivityType::Commits => {
                let walk = self.fetch_events::<Commit>(activity, org, repo, since).await?;
                Ok(logins(walk))
            }
            ActivityType::Issues => {
                let walk = self.fetch_events::<Issue>(activity, org, repo, since).await?;
                Ok(logins(walk))
            }
            ActivityType::IssueComments => {
                let walk = self
                    .fetch_events::<IssueComment>(activity, org, repo, since)
                    .await?;
                Ok(logins(walk))
            }
            ActivityType::PrComments => {
                let walk = self
                    .fetch_events::<PullRequestComment>(activity, org, repo, since)
                    .await?;
                Ok(logins(walk))
            }
        }
    }
}

fn logins<E: ActivityEvent>(walk: PageWalk<E>) -> ActorLogins {
    let gap = walk.gap();
    let logins = walk
        .items
        .iter()
        .filter_map(|e| e.actor_login())
        .map(str::to_string)
        .collect();
    ActorLogins::new(logins).with_gap(gap)
}

fn check_status(url: &str, response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }

    let message = serde_json::from_slice::<ErrorBody>(&response.body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| response.body_text());

    if response.status == 401 {
        return Err(DormantError::AuthError(message));
    }

    Err(DormantError::ApiError {
        status: response.status,
        url: url.to_string(),
        message,
    })
}

pub(crate) fn decode_body<T: DeserializeOwned>(url: &str, response: &HttpResponse) -> Result<T> {
    serde_json::from_slice(&response.body).map_err(|source| DormantError::Decode {
        url: url.to_string(),
        source,
    })
}
