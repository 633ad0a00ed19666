pub mod activity;
pub mod aggregate;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod link;
pub mod pagination;
pub mod progress;
pub mod report;
pub mod types;

mod pool;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

pub use activity::{ActivitySource, ActivityType, ActorLogins};
pub use aggregate::{ActivityAggregator, AggregationOutcome, SkippedFetch, UserIndex};
pub use client::{GitHubClient, QuotaProbe};
pub use config::{ConcurrencyConfig, Cutoff, FetchConfig, GitHubConfig, RateLimitConfig};
pub use error::{DormantError, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use limiter::{CancelHandle, QuotaSnapshot, RateBudget, RequestGovernor};
pub use pagination::PageWalk;
pub use progress::{ProgressCallback, ProgressEvent};
pub use report::{write_csv, DormantReport, ReportRow, ReportStats, UserSummary};
pub use types::{Repository, User};

/// Finds organization members with no recent activity.
pub struct DormantUserReporter {
    client: GitHubClient,
    fetch_emails: bool,
    window_months: Option<u32>,
    on_progress: Option<ProgressCallback>,
}

impl DormantUserReporter {
    pub fn new(token: Option<String>) -> Result<Self> {
        let builder = DormantUserReporterBuilder::new();
        match token {
            Some(token) => builder.token(token).build(),
            None => builder.build(),
        }
    }

    pub fn with_config(config: FetchConfig) -> Result<Self> {
        Ok(Self::from_client(GitHubClient::with_config(config)?))
    }

    pub fn from_client(client: GitHubClient) -> Self {
        Self {
            client,
            fetch_emails: false,
            window_months: Some(3),
            on_progress: None,
        }
    }

    pub fn client(&self) -> &GitHubClient {
        &self.client
    }

    /// Cancelling makes in-flight and future requests fail, and the run
    /// with them.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.client.governor().cancel_handle()
    }

    /// Scan `org` for activity since `cutoff` across the `enabled` types.
    ///
    /// Configuration problems are reported before any request is made.
    pub async fn run(
        &self,
        org: &str,
        cutoff: &Cutoff,
        enabled: &BTreeSet<ActivityType>,
    ) -> Result<DormantReport> {
        let org = org.trim();
        if org.is_empty() {
            return Err(DormantError::ConfigError(
                "Organization name is required".to_string(),
            ));
        }
        if enabled.is_empty() {
            return Err(DormantError::ConfigError(
                "At least one activity type must be enabled".to_string(),
            ));
        }
        if let Some(months) = self.window_months {
            cutoff.validate(Utc::now(), months)?;
        }

        let since = cutoff.to_iso();
        info!("Checking {} for activity since {}", org, since);

        self.client.preflight().await;

        let mut users = self.client.list_members(org).await?;
        if self.fetch_emails {
            self.client.fetch_emails(&mut users).await;
        }
        let repositories = self.client.list_repositories(org).await?;

        let workers = self.client.config().concurrency.repository_workers;
        let outcome = ActivityAggregator::new(Arc::new(self.client.clone()), workers)
            .with_progress(self.on_progress.clone())
            .run(org, users, repositories, &since, enabled)
            .await?;

        if !outcome.skipped.is_empty() {
            warn!(
                "{} repository fetches failed; affected members may be reported dormant",
                outcome.skipped.len()
            );
        }

        Ok(DormantReport::assemble(org, cutoff, outcome))
    }
}

pub struct DormantUserReporterBuilder {
    config: FetchConfig,
    token: Option<String>,
    transport: Option<Arc<dyn HttpTransport>>,
    quota_probe: Option<Arc<dyn QuotaProbe>>,
    fetch_emails: bool,
    window_months: Option<u32>,
    on_progress: Option<ProgressCallback>,
}

impl DormantUserReporterBuilder {
    pub fn new() -> Self {
        Self {
            config: FetchConfig::default(),
            token: None,
            transport: None,
            quota_probe: None,
            fetch_emails: false,
            window_months: Some(3),
            on_progress: None,
        }
    }

    pub fn config(mut self, config: FetchConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this token instead of reading `token_env_var`.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token_env_var(mut self, var_name: impl Into<String>) -> Self {
        self.config.github.token_env_var = var_name.into();
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.github.api_base_url = url.into();
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.github.user_agent = agent.into();
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.config.github.timeout_seconds = seconds;
        self
    }

    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.config.rate_limiting.max_concurrent_requests = limit;
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.rate_limiting.max_attempts = attempts;
        self
    }

    pub fn page_workers(mut self, workers: usize) -> Self {
        self.config.concurrency.page_workers = workers;
        self
    }

    pub fn repository_workers(mut self, workers: usize) -> Self {
        self.config.concurrency.repository_workers = workers;
        self
    }

    pub fn fetch_emails(mut self, enabled: bool) -> Self {
        self.fetch_emails = enabled;
        self
    }

    /// How far back the cutoff may lie. `None` accepts any past date.
    pub fn cutoff_window_months(mut self, months: Option<u32>) -> Self {
        self.window_months = months;
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Send requests through `transport` instead of an authenticated
    /// reqwest client. No token is needed in that case.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn quota_probe(mut self, probe: Arc<dyn QuotaProbe>) -> Self {
        self.quota_probe = Some(probe);
        self
    }

    pub fn build(self) -> Result<DormantUserReporter> {
        let mut client = match (self.transport, self.token) {
            (Some(transport), _) => GitHubClient::with_transport(transport, self.config),
            (None, Some(token)) => GitHubClient::with_token(self.config, token)?,
            (None, None) => GitHubClient::with_config(self.config)?,
        };
        if let Some(probe) = self.quota_probe {
            client = client.with_quota_probe(probe);
        }

        let mut reporter = DormantUserReporter::from_client(client);
        reporter.fetch_emails = self.fetch_emails;
        reporter.window_months = self.window_months;
        reporter.on_progress = self.on_progress;
        Ok(reporter)
    }
}

impl Default for DormantUserReporterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
