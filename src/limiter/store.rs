//! Shared counter store.
//!
//! The admission controller never reads a bucket and writes it back in two
//! steps. It asks the store for one atomic "refill, then take if enough"
//! operation per check. A networked store implements [`CounterStore::take`]
//! as a single server-side script; [`MemoryCounterStore`] does it under the
//! per-key shard lock of a [`DashMap`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::StoreError;

/// Future returned by [`CounterStore::take`].
pub type TakeFuture<'a> = Pin<Box<dyn Future<Output = Result<Take, StoreError>> + Send + 'a>>;

/// Token-bucket parameters for one key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bucket {
    pub capacity: f64,
    /// Tokens added per second.
    pub rate: f64,
}

/// Outcome of one atomic take.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Take {
    pub allowed: bool,
    /// Tokens left after this take (or untouched balance on denial).
    pub remaining: f64,
    /// Time until `cost` tokens will be available. Zero when allowed.
    pub retry_after: Duration,
}

/// A store that can refill-then-conditionally-decrement a bucket atomically.
///
/// Implementations must guarantee that concurrent calls for the same key
/// are serialised: two callers may never both observe the same balance and
/// both spend it.
pub trait CounterStore: Send + Sync + 'static {
    fn take<'a>(&'a self, key: &'a str, bucket: Bucket, cost: f64) -> TakeFuture<'a>;

    /// Forgets buckets untouched for at least `idle` and returns how many.
    ///
    /// Stores that expire keys on their own (a TTL on each key) keep the
    /// default, which does nothing.
    fn purge_idle(&self, idle: Duration) -> usize {
        let _ = idle;
        0
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

/// In-process [`CounterStore`] for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    buckets: DashMap<String, BucketState>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn take_now(&self, key: &str, bucket: Bucket, cost: f64) -> Take {
        let now = Instant::now();
        // The entry guard holds the shard write lock until the end of this
        // function: refill and decrement are one critical section per key.
        let mut state = self.buckets.entry(key.to_owned()).or_insert_with(|| BucketState {
            tokens: bucket.capacity,
            refilled_at: now,
        });

        let elapsed = now.saturating_duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * bucket.rate).min(bucket.capacity);
        state.refilled_at = now;

        if state.tokens >= cost {
            state.tokens -= cost;
            Take { allowed: true, remaining: state.tokens, retry_after: Duration::ZERO }
        } else {
            Take {
                allowed: false,
                remaining: state.tokens,
                retry_after: wait_for(cost - state.tokens, bucket.rate),
            }
        }
    }
}

impl CounterStore for MemoryCounterStore {
    fn take<'a>(&'a self, key: &'a str, bucket: Bucket, cost: f64) -> TakeFuture<'a> {
        let outcome = self.take_now(key, bucket, cost);
        Box::pin(async move { Ok(outcome) })
    }

    /// Pick `idle` no shorter than the slowest full-refill time of any
    /// policy: a forgotten bucket comes back full.
    fn purge_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| now.saturating_duration_since(state.refilled_at) < idle);
        before.saturating_sub(self.buckets.len())
    }
}

/// Time for `deficit` tokens to accumulate at `rate` per second.
fn wait_for(deficit: f64, rate: f64) -> Duration {
    if rate <= 0.0 {
        return Duration::MAX;
    }
    Duration::try_from_secs_f64(deficit / rate).unwrap_or(Duration::MAX)
}
