use chrono::{DateTime, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DormantError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfig {
    pub github: GitHubConfig,
    pub rate_limiting: RateLimitConfig,
    pub concurrency: ConcurrencyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub token_env_var: String,
    pub api_base_url: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token_env_var: "GITHUB_TOKEN".to_string(),
            api_base_url: "https://api.github.com".to_string(),
            user_agent: "dormant-users/0.1.0".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl GitHubConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn token(&self) -> Result<String> {
        std::env::var(&self.token_env_var).map_err(|_| {
            DormantError::AuthError(format!("{} environment variable not set", self.token_env_var))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Upper bound on requests in flight across every worker pool.
    pub max_concurrent_requests: usize,
    /// Hourly quota assumed when the preflight probe is skipped or fails.
    pub default_hourly_limit: u32,
    /// Fraction of the remaining quota the pacer is allowed to spend.
    pub safety_factor: f64,
    pub burst: u32,
    pub reset_buffer_seconds: u64,
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub preflight_probe: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            default_hourly_limit: 5000,
            safety_factor: 0.9,
            burst: 1,
            reset_buffer_seconds: 5,
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            preflight_probe: true,
        }
    }
}

impl RateLimitConfig {
    pub fn reset_buffer(&self) -> Duration {
        Duration::from_secs(self.reset_buffer_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub page_workers: usize,
    pub repository_workers: usize,
    pub email_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            page_workers: 5,
            repository_workers: 5,
            email_workers: 5,
        }
    }
}

/// Human input form of the cutoff date, e.g. `Jan 2 2006`.
pub const CUTOFF_INPUT_FORMAT: &str = "%b %d %Y";

/// The instant activity is counted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cutoff(DateTime<Utc>);

impl Cutoff {
    pub fn parse(input: &str) -> Result<Self> {
        let date = NaiveDate::parse_from_str(input.trim(), CUTOFF_INPUT_FORMAT).map_err(|e| {
            DormantError::ConfigError(format!(
                "Invalid date '{}', expected a date like 'Jan 2 2006': {}",
                input, e
            ))
        })?;
        Ok(Self(date.and_time(NaiveTime::MIN).and_utc()))
    }

    pub fn from_datetime(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn to_iso(&self) -> String {
        self.0.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    /// Rejects cutoffs in the future or further back than `window_months`.
    pub fn validate(&self, now: DateTime<Utc>, window_months: u32) -> Result<()> {
        if self.0 > now {
            return Err(DormantError::ConfigError(format!(
                "Date {} is in the future",
                self.to_iso()
            )));
        }
        let earliest = now
            .checked_sub_months(Months::new(window_months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if self.0 < earliest {
            return Err(DormantError::ConfigError(format!(
                "Date must be within the last {} months",
                window_months
            )));
        }
        Ok(())
    }
}
