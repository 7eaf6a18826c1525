//! Token-bucket limiter buckets
//!
//! Each tier (global, per-identity, per-endpoint) is backed by an
//! independent token bucket, built on `governor`.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A single keyed bucket (one per identity, endpoint, or the one global
/// bucket). Cheap to clone — shares the underlying governor state.
#[derive(Clone)]
pub struct LimiterBucket {
    limiter: Arc<DirectLimiter>,
}

impl LimiterBucket {
    pub fn new(rps: u32, burst: u32) -> Self {
        let rps = NonZeroU32::new(rps.max(1)).unwrap();
        let burst = NonZeroU32::new(burst.max(1)).unwrap();
        let quota = Quota::per_second(rps).allow_burst(burst);
        Self { limiter: Arc::new(RateLimiter::direct(quota)) }
    }

    /// Returns `true` if this request is allowed under the bucket's quota.
    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
