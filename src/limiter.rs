//! Request governor: one gate combining a concurrency permit pool with a
//! token bucket paced against the quota GitHub reports.
//!
//! Every outbound request goes through [`RequestGovernor::acquire`]. After a
//! response arrives the caller feeds its headers back through
//! [`RequestGovernor::update_from_headers`] and hands the permit to
//! [`RequestGovernor::release_and_backoff`], which frees the permit before
//! any throttling sleep so one penalised worker never blocks the others.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::config::RateLimitConfig;
use crate::error::{DormantError, Result};
use crate::http::{header_get, HttpHeaders};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const HOUR: Duration = Duration::from_secs(3600);

/// Relative change in refill period below which the running bucket is kept.
const REPACE_TOLERANCE: f64 = 0.1;

/// Account quota as reported by the rate-limit endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Current view of the shared rate budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBudget {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub burst: u32,
    pub refill_period: Duration,
}

impl RateBudget {
    /// Upper bound on tokens the bucket can hand out within `window`,
    /// starting from a full bucket.
    pub fn max_grants_within(&self, window: Duration) -> u64 {
        let refills = if self.refill_period.is_zero() {
            u64::MAX
        } else {
            (window.as_secs_f64() / self.refill_period.as_secs_f64()).floor() as u64
        };
        (self.burst as u64).saturating_add(refills)
    }

    pub fn requests_per_second(&self) -> f64 {
        if self.refill_period.is_zero() {
            f64::INFINITY
        } else {
            1.0 / self.refill_period.as_secs_f64()
        }
    }
}

/// Caller-side trigger that makes pending and future `acquire()` calls fail.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Held while a request is in flight. Dropping it returns the permit.
#[derive(Debug)]
pub struct GovernorPermit {
    permit: OwnedSemaphorePermit,
}

impl GovernorPermit {
    /// Same as dropping the permit.
    pub fn release(self) {
        drop(self.permit);
    }
}

pub struct RequestGovernor {
    permits: Arc<Semaphore>,
    pacer: RwLock<Arc<DirectRateLimiter>>,
    budget: Mutex<RateBudget>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    config: RateLimitConfig,
}

impl RequestGovernor {
    pub fn new(config: RateLimitConfig) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        let (limiter, budget) = Self::hourly_pacer(&config, config.default_hourly_limit);

        Self {
            permits,
            pacer: RwLock::new(Arc::new(limiter)),
            budget: Mutex::new(budget),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    pub fn budget(&self) -> RateBudget {
        *self.budget.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a concurrency permit and a pacing token.
    ///
    /// Only fails when the governor has been cancelled.
    pub async fn acquire(&self) -> Result<GovernorPermit> {
        if *self.cancel_rx.borrow() {
            return Err(DormantError::Cancelled);
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| DormantError::Cancelled)?
            }
            _ = wait_cancelled(self.cancel_rx.clone()) => return Err(DormantError::Cancelled),
        };

        let pacer = self.current_pacer();
        tokio::select! {
            _ = pacer.until_ready() => {}
            _ = wait_cancelled(self.cancel_rx.clone()) => return Err(DormantError::Cancelled),
        }

        Ok(GovernorPermit { permit })
    }

    /// Recalibrate pacing from `X-RateLimit-*` response headers.
    pub fn update_from_headers(&self, headers: &HttpHeaders) {
        let Some(remaining) = parse_header::<u32>(headers, "x-ratelimit-remaining") else {
            return;
        };
        let reset_at = parse_header::<i64>(headers, "x-ratelimit-reset")
            .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
        let limit = parse_header::<u32>(headers, "x-ratelimit-limit");

        self.recalibrate(remaining, reset_at, limit, Utc::now());
    }

    /// Seed pacing from the preflight quota probe.
    pub fn seed(&self, quota: QuotaSnapshot) {
        info!(
            "Rate limit: {}/{} remaining, resets at {}",
            quota.remaining, quota.limit, quota.reset_at
        );
        let now = Utc::now();
        if quota.reset_at > now {
            self.recalibrate(quota.remaining, Some(quota.reset_at), Some(quota.limit), now);
        } else {
            let (limiter, budget) = Self::hourly_pacer(&self.config, quota.limit);
            self.install(limiter, budget);
        }
    }

    /// Spread `floor(remaining * safety_factor)` requests over the time left
    /// until `reset_at`.
    pub(crate) fn recalibrate(
        &self,
        remaining: u32,
        reset_at: Option<DateTime<Utc>>,
        limit: Option<u32>,
        now: DateTime<Utc>,
    ) {
        let window = reset_at
            .and_then(|reset| (reset - now).to_std().ok())
            .filter(|w| !w.is_zero());

        let mut budget = self.budget();
        budget.remaining = Some(remaining);
        budget.reset_at = reset_at;
        budget.limit = limit.or(budget.limit);

        let Some(window) = window else {
            self.set_budget(budget);
            return;
        };
        if remaining == 0 {
            // Nothing left to pace; release_and_backoff sleeps until reset.
            self.set_budget(budget);
            return;
        }

        let spendable = ((remaining as f64) * self.config.safety_factor).floor().max(1.0) as u32;
        let running = budget;
        let (limiter, budget) = Self::spread(&self.config, spendable, window, budget);
        if running.burst == budget.burst
            && period_drift(running.refill_period, budget.refill_period) <= REPACE_TOLERANCE
        {
            // Close enough; keep the running bucket and its spent tokens.
            self.set_budget(running);
            return;
        }
        debug!(
            "Pacing {} requests over {:?} ({:.3} req/s, burst {})",
            spendable,
            window,
            budget.requests_per_second(),
            budget.burst
        );
        self.install(limiter, budget);
    }

    /// Release the permit, then sleep if the response asked us to back off.
    ///
    /// Returns whether a backoff sleep happened.
    pub async fn release_and_backoff(&self, permit: GovernorPermit, headers: &HttpHeaders) -> bool {
        permit.release();

        let Some(delay) = self.backoff_delay(headers, Utc::now()) else {
            return false;
        };
        warn!("Rate limited, backing off for {:?}", delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_cancelled(self.cancel_rx.clone()) => {}
        }
        true
    }

    /// `Retry-After` wins; otherwise an exhausted quota waits for the reset.
    pub(crate) fn backoff_delay(&self, headers: &HttpHeaders, now: DateTime<Utc>) -> Option<Duration> {
        if let Some(seconds) = parse_header::<u64>(headers, "retry-after") {
            return Some(Duration::from_secs(seconds));
        }

        if parse_header::<u32>(headers, "x-ratelimit-remaining") == Some(0) {
            let reset_at = parse_header::<i64>(headers, "x-ratelimit-reset")
                .and_then(|epoch| DateTime::from_timestamp(epoch, 0))?;
            let until_reset = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
            return Some(until_reset + self.config.reset_buffer());
        }

        None
    }

    fn current_pacer(&self) -> Arc<DirectRateLimiter> {
        Arc::clone(&self.pacer.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Swap in a new bucket. A fresh bucket starts full, so it is emptied
    /// first; otherwise every swap would hand out a free burst.
    fn install(&self, limiter: DirectRateLimiter, budget: RateBudget) {
        let mut drained = 0;
        while drained < budget.burst && limiter.check().is_ok() {
            drained += 1;
        }
        *self.pacer.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(limiter);
        self.set_budget(budget);
    }

    fn set_budget(&self, budget: RateBudget) {
        *self.budget.lock().unwrap_or_else(|e| e.into_inner()) = budget;
    }

    fn hourly_pacer(config: &RateLimitConfig, hourly_limit: u32) -> (DirectRateLimiter, RateBudget) {
        let spendable = ((hourly_limit.max(1) as f64) * config.safety_factor)
            .floor()
            .max(1.0) as u32;
        let budget = RateBudget {
            limit: Some(hourly_limit),
            remaining: None,
            reset_at: None,
            burst: 1,
            refill_period: HOUR,
        };
        Self::spread(config, spendable, HOUR, budget)
    }

    /// Bucket granting at most `spendable` tokens within `window`: `burst`
    /// up front and one per period after that. The period is strictly longer
    /// than `window / refills` so the refill landing on the window edge is
    /// never granted.
    fn spread(
        config: &RateLimitConfig,
        spendable: u32,
        window: Duration,
        mut budget: RateBudget,
    ) -> (DirectRateLimiter, RateBudget) {
        let burst = config.burst.clamp(1, spendable.max(1));
        let refills = spendable - burst + 1;
        let period = window / refills + Duration::from_nanos(1);

        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));

        budget.burst = burst;
        budget.refill_period = period;
        (RateLimiter::direct(quota), budget)
    }
}

fn period_drift(current: Duration, next: Duration) -> f64 {
    let current = current.as_secs_f64();
    if current == 0.0 {
        return f64::INFINITY;
    }
    (next.as_secs_f64() - current).abs() / current
}

fn parse_header<T: std::str::FromStr>(headers: &HttpHeaders, name: &str) -> Option<T> {
    header_get(headers, name).and_then(|v| v.trim().parse().ok())
}

async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::time::Instant;

    fn fast_config(max_concurrent: usize) -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent_requests: max_concurrent,
            default_hourly_limit: 3_600_000,
            burst: 1000,
            ..RateLimitConfig::default()
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HttpHeaders {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_recalibrated_rate_respects_remaining_quota() {
        let governor = RequestGovernor::new(RateLimitConfig::default());
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let reset = now + chrono::Duration::seconds(100);

        governor.recalibrate(10, Some(reset), Some(5000), now);

        let budget = governor.budget();
        assert_eq!(budget.remaining, Some(10));
        assert_eq!(budget.reset_at, Some(reset));
        assert!(budget.max_grants_within(Duration::from_secs(100)) <= 10);
        assert!(budget.requests_per_second() <= 10.0 / 100.0);
    }

    #[test]
    fn test_recalibration_from_headers() {
        let governor = RequestGovernor::new(RateLimitConfig::default());
        let reset = Utc::now().timestamp() + 3600;
        governor.update_from_headers(&headers(&[
            ("X-RateLimit-Limit", "5000"),
            ("X-RateLimit-Remaining", "4000"),
            ("X-RateLimit-Reset", &reset.to_string()),
        ]));

        let budget = governor.budget();
        assert_eq!(budget.limit, Some(5000));
        assert_eq!(budget.remaining, Some(4000));
        assert_eq!(budget.burst, 1);
        assert!(budget.requests_per_second() < 1.0);
    }

    #[test]
    fn test_large_quota_spread_over_full_window() {
        let governor = RequestGovernor::new(RateLimitConfig::default());
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        governor.recalibrate(4000, Some(now + chrono::Duration::hours(1)), None, now);

        // 3600 spendable tokens, burst included
        assert!(governor.budget().max_grants_within(HOUR) <= 3600);
        assert!(governor.budget().max_grants_within(HOUR) >= 3500);
    }

    #[test]
    fn test_small_drift_keeps_running_bucket() {
        let governor = RequestGovernor::new(RateLimitConfig::default());
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let reset = now + chrono::Duration::seconds(1000);

        governor.recalibrate(1000, Some(reset), None, now);
        let running = governor.current_pacer();
        let period = governor.budget().refill_period;

        let later = now + chrono::Duration::seconds(1);
        governor.recalibrate(999, Some(reset), None, later);
        assert!(Arc::ptr_eq(&running, &governor.current_pacer()));
        assert_eq!(governor.budget().remaining, Some(999));
        assert_eq!(governor.budget().refill_period, period);

        governor.recalibrate(100, Some(reset), None, later);
        assert!(!Arc::ptr_eq(&running, &governor.current_pacer()));
        assert!(governor.budget().refill_period > period * 5);
    }

    #[tokio::test]
    async fn test_successive_responses_do_not_refill_the_bucket() {
        let governor = RequestGovernor::new(RateLimitConfig::default());
        let reset = (Utc::now().timestamp() + 100).to_string();

        let mut granted = 0;
        for remaining in (1..=10u32).rev() {
            governor.update_from_headers(&headers(&[
                ("X-RateLimit-Remaining", &remaining.to_string()),
                ("X-RateLimit-Reset", &reset),
            ]));
            let attempt = tokio::time::timeout(Duration::from_millis(20), governor.acquire()).await;
            if attempt.is_ok() {
                granted += 1;
            }
        }

        // 9 spendable over ~100s means one grant every ~11s at best
        assert_eq!(granted, 0);
    }

    #[test]
    fn test_headers_without_quota_leave_budget_alone() {
        let governor = RequestGovernor::new(RateLimitConfig::default());
        let before = governor.budget();
        governor.update_from_headers(&headers(&[("Content-Type", "application/json")]));
        assert_eq!(governor.budget(), before);
    }

    #[test]
    fn test_backoff_delay_prefers_retry_after() {
        let governor = RequestGovernor::new(RateLimitConfig::default());
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let reset = (now + chrono::Duration::seconds(60)).timestamp().to_string();

        let secondary = headers(&[("Retry-After", "7"), ("X-RateLimit-Remaining", "0")]);
        assert_eq!(
            governor.backoff_delay(&secondary, now),
            Some(Duration::from_secs(7))
        );

        let exhausted = headers(&[("X-RateLimit-Remaining", "0"), ("X-RateLimit-Reset", &reset)]);
        assert_eq!(
            governor.backoff_delay(&exhausted, now),
            Some(Duration::from_secs(65))
        );

        let healthy = headers(&[("X-RateLimit-Remaining", "12"), ("X-RateLimit-Reset", &reset)]);
        assert_eq!(governor.backoff_delay(&healthy, now), None);
    }

    #[test]
    fn test_seed_with_past_reset_uses_hourly_limit() {
        let governor = RequestGovernor::new(RateLimitConfig::default());
        governor.seed(QuotaSnapshot {
            limit: 15000,
            remaining: 15000,
            reset_at: Utc::now() - chrono::Duration::seconds(5),
        });
        let budget = governor.budget();
        assert_eq!(budget.limit, Some(15000));
        assert!(budget.max_grants_within(HOUR) <= 13500);
    }

    #[tokio::test]
    async fn test_permits_bound_in_flight_requests() {
        let governor = RequestGovernor::new(fast_config(2));
        let first = governor.acquire().await.unwrap();
        let _second = governor.acquire().await.unwrap();
        assert_eq!(governor.available_permits(), 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), governor.acquire()).await;
        assert!(blocked.is_err());

        first.release();
        assert_eq!(governor.available_permits(), 1);
        assert!(governor.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_releases_permit_before_sleeping() {
        let governor = Arc::new(RequestGovernor::new(fast_config(1)));
        let permit = governor.acquire().await.unwrap();
        assert_eq!(governor.available_permits(), 0);

        let started = Instant::now();
        let throttled = headers(&[("Retry-After", "30")]);
        let backing_off = Arc::clone(&governor);
        let backoff = tokio::spawn(async move {
            backing_off.release_and_backoff(permit, &throttled).await
        });

        let other = governor.acquire().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        other.release();

        assert!(backoff.await.unwrap());
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_acquire() {
        let governor = Arc::new(RequestGovernor::new(fast_config(1)));
        let _held = governor.acquire().await.unwrap();

        let waiting = Arc::clone(&governor);
        let pending = tokio::spawn(async move { waiting.acquire().await });

        tokio::task::yield_now().await;
        governor.cancel_handle().cancel();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(DormantError::Cancelled)));
        assert!(matches!(
            governor.acquire().await,
            Err(DormantError::Cancelled)
        ));
    }
}
