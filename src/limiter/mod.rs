//! Admission control.
//!
//! Every non-exempt request spends one token from a continuously refilling
//! bucket. Which bucket depends on who is asking:
//!
//! | Caller | Key | Default budget |
//! |---|---|---|
//! | anonymous | `rl:ip:<client address>` | 10 tokens, full refill in 60 s |
//! | authenticated | `rl:user:<subject>` | 60 tokens, full refill in 60 s |
//!
//! Buckets live in a [`CounterStore`] shared by every gateway instance. When
//! the store cannot answer, the configured [`FailureMode`] decides whether
//! the request goes through.

pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::StoreError;

pub use store::{Bucket, CounterStore, MemoryCounterStore, Take};

/// Rate-limit response header names.
pub mod headers {
    pub const LIMIT: &str = "x-ratelimit-limit";
    pub const REMAINING: &str = "x-ratelimit-remaining";
    /// Unix timestamp at which the denied request may be retried; `0` when allowed.
    pub const RESET: &str = "x-ratelimit-reset";
    pub const RETRY_AFTER: &str = "retry-after";
}

/// Budget for one class of caller.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Policy {
    pub const fn anonymous() -> Self {
        Self { capacity: 10, refill_per_sec: 10.0 / 60.0 }
    }

    pub const fn authenticated() -> Self {
        Self { capacity: 60, refill_per_sec: 60.0 / 60.0 }
    }

    fn bucket(self) -> Bucket {
        Bucket { capacity: f64::from(self.capacity), rate: self.refill_per_sec }
    }

    /// Time for an empty bucket to fill completely. `None` if it never does
    /// within a representable duration.
    pub fn full_refill(self) -> Option<Duration> {
        if self.refill_per_sec <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(f64::from(self.capacity) / self.refill_per_sec).ok()
    }
}

/// What to do when the counter store is unreachable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Let the request through without a quota decision.
    #[default]
    Open,
    /// Refuse the request with `503 Service Unavailable`.
    Closed,
}

/// Rate-limit settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub anonymous: Policy,
    pub authenticated: Policy,
    pub failure_mode: FailureMode,
    /// Upper bound on one counter-store round trip.
    pub store_timeout_ms: u64,
    /// Paths that bypass admission and access logging. An entry matches the
    /// path itself and anything below it.
    pub exempt_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            anonymous: Policy::anonymous(),
            authenticated: Policy::authenticated(),
            failure_mode: FailureMode::Open,
            store_timeout_ms: 250,
            exempt_paths: ["/health", "/healthz", "/readyz", "/docs", "/redoc", "/openapi.json"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Quota status for one admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Effective bucket capacity.
    pub limit: u32,
    /// Whole tokens left.
    pub remaining: u32,
    pub retry_after: Duration,
}

impl Decision {
    /// Value for [`headers::RESET`].
    pub fn reset_at(&self) -> i64 {
        if self.allowed {
            return 0;
        }
        let wait = i64::try_from(retry_secs(self.retry_after)).unwrap_or(i64::MAX);
        Utc::now().timestamp().saturating_add(wait)
    }

    /// Value for [`headers::RETRY_AFTER`], in whole seconds rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        retry_secs(self.retry_after)
    }
}

fn retry_secs(d: Duration) -> u64 {
    d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0))
}

/// Result of [`AdmissionController::admit`], with the failure mode applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted(Decision),
    Rejected(Decision),
    /// Store unreachable, failing open.
    Unmetered,
    /// Store unreachable, failing closed.
    Unavailable,
}

/// Decides allow/deny for each request against the shared bucket store.
pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    store_failures: AtomicU64,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config, store_failures: AtomicU64::new(0) }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Number of checks that could not reach the counter store.
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.config.exempt_paths.iter().any(|p| {
            path == p
                || path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with('/') || p.ends_with('/'))
        })
    }

    /// Forgets buckets idle for at least the slowest full-refill time of the
    /// two policies. Such a bucket is full again, so dropping it changes no
    /// future decision. Returns the number of buckets removed.
    pub fn sweep_idle(&self) -> usize {
        let (Some(anon), Some(auth)) = (self.config.anonymous.full_refill(), self.config.authenticated.full_refill())
        else {
            return 0;
        };
        let removed = self.store.purge_idle(anon.max(auth));
        if removed > 0 {
            debug!(removed, "idle rate-limit buckets purged");
        }
        removed
    }

    /// Spends `cost` tokens from the caller's bucket.
    pub async fn check(&self, ctx: &RequestContext, cost: u32) -> Result<Decision, StoreError> {
        let (key, policy) = match ctx.subject() {
            Some(subject) => (format!("rl:user:{subject}"), self.config.authenticated),
            None => (format!("rl:ip:{}", ctx.client_addr()), self.config.anonymous),
        };

        let timeout = Duration::from_millis(self.config.store_timeout_ms);
        let take = tokio::time::timeout(timeout, self.store.take(&key, policy.bucket(), f64::from(cost)))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        debug!(key = %key, allowed = take.allowed, remaining = take.remaining, "admission check");

        Ok(Decision {
            allowed: take.allowed,
            limit: policy.capacity,
            remaining: take.remaining.max(0.0).floor() as u32,
            retry_after: take.retry_after,
        })
    }

    /// Runs a cost-1 [`check`](Self::check) and applies the failure mode.
    pub async fn admit(&self, ctx: &RequestContext) -> Admission {
        match self.check(ctx, 1).await {
            Ok(d) if d.allowed => Admission::Granted(d),
            Ok(d) => {
                debug!(
                    request_id = ctx.request_id(),
                    client = ctx.client_addr(),
                    retry_after = ?d.retry_after,
                    "request over quota"
                );
                Admission::Rejected(d)
            }
            Err(e) => {
                self.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request_id = ctx.request_id(),
                    error = %e,
                    failure_mode = ?self.config.failure_mode,
                    "rate-limit store unavailable"
                );
                match self.config.failure_mode {
                    FailureMode::Open => Admission::Unmetered,
                    FailureMode::Closed => Admission::Unavailable,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::store::TakeFuture;
    use http::Method;

    struct DownStore;

    impl CounterStore for DownStore {
        fn take<'a>(&'a self, _: &'a str, _: Bucket, _: f64) -> TakeFuture<'a> {
            Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
        }
    }

    struct StuckStore;

    impl CounterStore for StuckStore {
        fn take<'a>(&'a self, _: &'a str, _: Bucket, _: f64) -> TakeFuture<'a> {
            Box::pin(std::future::pending())
        }
    }

    fn anon(addr: &str) -> RequestContext {
        RequestContext::new(addr, Method::GET, "/api/items")
    }

    fn controller(store: impl CounterStore, mode: FailureMode) -> AdmissionController {
        let config = RateLimitConfig { failure_mode: mode, ..RateLimitConfig::default() };
        AdmissionController::new(Arc::new(store), config)
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_burst_then_denied() {
        let limiter = controller(MemoryCounterStore::new(), FailureMode::Open);
        let ctx = anon("203.0.113.9");
        for i in 0..10 {
            let d = limiter.check(&ctx, 1).await.unwrap();
            assert!(d.allowed, "request {i} should pass");
            assert_eq!(d.limit, 10);
            assert_eq!(d.remaining, 9 - i);
        }
        let d = limiter.check(&ctx, 1).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_secs(), 6);
        assert!(d.reset_at() >= Utc::now().timestamp() + 5);
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_callers_get_the_larger_budget() {
        let limiter = controller(MemoryCounterStore::new(), FailureMode::Open);
        let ctx = anon("203.0.113.9");
        ctx.set_subject("user-42").unwrap();
        for _ in 0..60 {
            assert!(limiter.check(&ctx, 1).await.unwrap().allowed);
        }
        let d = limiter.check(&ctx, 1).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.limit, 60);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_secs(), 1);

        // Same address, no subject: separate anonymous bucket.
        assert!(limiter.check(&anon("203.0.113.9"), 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn store_outage_follows_failure_mode() {
        let ctx = anon("203.0.113.9");

        let open = controller(DownStore, FailureMode::Open);
        assert_eq!(open.admit(&ctx).await, Admission::Unmetered);
        assert_eq!(open.store_failures(), 1);

        let closed = controller(DownStore, FailureMode::Closed);
        assert_eq!(closed.admit(&ctx).await, Admission::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_is_an_outage() {
        let limiter = controller(StuckStore, FailureMode::Closed);
        let err = limiter.check(&anon("198.51.100.1"), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert_eq!(limiter.admit(&anon("198.51.100.1")).await, Admission::Unavailable);
    }

    #[test]
    fn exempt_paths_match_whole_segments() {
        let limiter = controller(MemoryCounterStore::new(), FailureMode::Open);
        assert!(limiter.is_exempt("/health"));
        assert!(limiter.is_exempt("/docs/index.html"));
        assert!(!limiter.is_exempt("/healthcheck"));
        assert!(!limiter.is_exempt("/api/health"));
    }

    #[test]
    fn retry_after_rounds_up() {
        let d = Decision {
            allowed: false,
            limit: 10,
            remaining: 0,
            retry_after: Duration::from_millis(5_001),
        };
        assert_eq!(d.retry_after_secs(), 6);
    }

    #[test]
    fn unbounded_wait_saturates_instead_of_overflowing() {
        let d = Decision { allowed: false, limit: 10, remaining: 0, retry_after: Duration::MAX };
        assert_eq!(d.retry_after_secs(), u64::MAX);
        assert_eq!(d.reset_at(), i64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn near_zero_refill_denies_without_panicking() {
        let config = RateLimitConfig {
            anonymous: Policy { capacity: 1, refill_per_sec: 1e-20 },
            ..RateLimitConfig::default()
        };
        let limiter = AdmissionController::new(Arc::new(MemoryCounterStore::new()), config);
        let ctx = anon("198.51.100.3");
        assert!(matches!(limiter.admit(&ctx).await, Admission::Granted(_)));
        match limiter.admit(&ctx).await {
            Admission::Rejected(d) => assert!(d.retry_after_secs() > 1_000_000),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_forgets_only_buckets_that_would_be_full_again() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = AdmissionController::new(store.clone(), RateLimitConfig::default());
        for i in 0..50 {
            limiter.check(&anon(&format!("203.0.113.{i}")), 1).await.unwrap();
        }
        assert_eq!(store.len(), 50);

        // Both default policies refill completely in 60 s.
        tokio::time::advance(Duration::from_secs(59)).await;
        limiter.check(&anon("203.0.113.200"), 1).await.unwrap();
        assert_eq!(limiter.sweep_idle(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.sweep_idle(), 50);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn full_refill_of_default_policies() {
        for policy in [Policy::anonymous(), Policy::authenticated()] {
            let secs = policy.full_refill().unwrap().as_secs_f64();
            assert!((secs - 60.0).abs() < 1e-6, "{policy:?} refills in {secs}s");
        }
        assert_eq!(Policy { capacity: 10, refill_per_sec: 0.0 }.full_refill(), None);
    }
}
