//! Tiered rate limiter
//!
//! Global → per-identity → per-endpoint → quota tiers,
//! first-rejection-wins (the first tier that denies short-circuits the
//! rest), followed by DDoS pattern detection as a separate mitigation step.
//! A denial beyond `block_threshold` consecutive violations for one
//! identity inserts into the blocklist with exponential backoff.

pub mod bucket;
pub mod ddos;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::blocklist::Blocklist;
use crate::config::RateLimitConfig;
use crate::counters::{names, Counters};
use crate::error::FlowError;
use bucket::LimiterBucket;
use ddos::DdosDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Global,
    Identity,
    Endpoint,
    Quota,
    Ddos,
}

impl Tier {
    fn label(self) -> &'static str {
        match self {
            Tier::Global => "global",
            Tier::Identity => "identity",
            Tier::Endpoint => "endpoint",
            Tier::Quota => "quota",
            Tier::Ddos => "ddos",
        }
    }
}

struct IdentityState {
    bucket: LimiterBucket,
    consecutive_violations: AtomicU32,
}

/// Hard hour/day request caps per identity, independent of the token-bucket
/// tiers above — a token bucket smooths bursts but never stops a client
/// that trickles requests in just under its refill rate; the quota tier
/// catches that.
struct QuotaState {
    hour_start: Instant,
    hour_count: u64,
    day_start: Instant,
    day_count: u64,
}

impl QuotaState {
    fn new() -> Self {
        let now = Instant::now();
        Self { hour_start: now, hour_count: 0, day_start: now, day_count: 0 }
    }

    fn check_and_record(&mut self, quota_per_hour: u64, quota_per_day: u64) -> bool {
        let now = Instant::now();
        if now.duration_since(self.hour_start) >= Duration::from_secs(3600) {
            self.hour_start = now;
            self.hour_count = 0;
        }
        if now.duration_since(self.day_start) >= Duration::from_secs(86400) {
            self.day_start = now;
            self.day_count = 0;
        }
        if self.hour_count >= quota_per_hour || self.day_count >= quota_per_day {
            return false;
        }
        self.hour_count += 1;
        self.day_count += 1;
        true
    }
}

/// Orchestrates all rate-limit tiers for one node and owns the whitelist
/// exclusion and backoff-driven blocklist insertion.
pub struct RateLimiter {
    config: RateLimitConfig,
    global: LimiterBucket,
    per_identity: DashMap<String, IdentityState>,
    per_endpoint: DashMap<(String, String), LimiterBucket>,
    quota: DashMap<String, Mutex<QuotaState>>,
    whitelist: HashSet<String>,
    ddos: DdosDetector,
    blocklist: Blocklist,
    counters: Counters,
    /// Per-identity (rps, burst) override pushed down from the control
    /// plane's `rateLimitOverrides`, consulted instead of
    /// `per_identity_rps`/`burst` when present.
    overrides: DashMap<String, (u32, u32)>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, blocklist: Blocklist) -> Self {
        Self::with_counters(config, blocklist, Counters::new())
    }

    pub fn with_counters(config: RateLimitConfig, blocklist: Blocklist, counters: Counters) -> Self {
        let global = LimiterBucket::new(config.global_rps, config.global_burst);
        let whitelist = config.whitelist.iter().cloned().collect();
        let ddos = DdosDetector::new(config.ddos.clone());
        Self {
            global,
            per_identity: DashMap::new(),
            per_endpoint: DashMap::new(),
            quota: DashMap::new(),
            whitelist,
            ddos,
            blocklist,
            counters,
            overrides: DashMap::new(),
            config,
        }
    }

    /// Replace the per-identity override table with the control plane's
    /// latest `rateLimitOverrides`. Only affects identities that acquire a
    /// fresh bucket afterward; an identity with a bucket already live keeps
    /// its prior quota until it idles out.
    pub fn apply_overrides(&self, overrides: &[crate::controlplane::RateLimitOverride]) {
        self.overrides.clear();
        for o in overrides {
            self.overrides.insert(o.target_id.clone(), (o.rps, o.burst));
        }
    }

    fn is_whitelisted(&self, identity: &str) -> bool {
        self.whitelist.contains(identity)
    }

    /// Check all tiers for one request. `identity` is the client-type key
    /// (IP or authenticated subject); `endpoint` scopes the per-endpoint
    /// tier for routes configured as "expensive".
    pub fn check(&self, src: IpAddr, identity: &str, endpoint: &str) -> Result<(), FlowError> {
        if !self.config.enabled || self.is_whitelisted(identity) {
            return Ok(());
        }

        if !self.global.check() {
            return Err(self.deny(Tier::Global, src, identity));
        }

        let identity_state = self.per_identity.entry(identity.to_string()).or_insert_with(|| {
            let (rps, burst) = self
                .overrides
                .get(identity)
                .map(|o| *o)
                .unwrap_or((self.config.per_identity_rps, self.config.per_identity_burst));
            IdentityState { bucket: LimiterBucket::new(rps, burst), consecutive_violations: AtomicU32::new(0) }
        });
        if !identity_state.bucket.check() {
            let violations = identity_state.consecutive_violations.fetch_add(1, Ordering::Relaxed) + 1;
            drop(identity_state);
            self.maybe_block(src, violations);
            return Err(self.deny(Tier::Identity, src, identity));
        }
        identity_state.consecutive_violations.store(0, Ordering::Relaxed);
        drop(identity_state);

        if let Some(expensive) = self.config.expensive_endpoints.iter().find(|e| e.path == endpoint) {
            let key = (identity.to_string(), endpoint.to_string());
            let bucket = self
                .per_endpoint
                .entry(key)
                .or_insert_with(|| LimiterBucket::new(expensive.rps, expensive.burst));
            if !bucket.check() {
                return Err(self.deny(Tier::Endpoint, src, identity));
            }
        }

        let quota_entry = self.quota.entry(identity.to_string()).or_insert_with(|| Mutex::new(QuotaState::new()));
        let within_quota = {
            let mut quota_state = quota_entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            quota_state.check_and_record(self.config.quota_per_hour, self.config.quota_per_day)
        };
        drop(quota_entry);
        if !within_quota {
            return Err(self.deny(Tier::Quota, src, identity));
        }

        if let Some((reason, severity)) = self.ddos.observe(src, endpoint, None) {
            let duration = severity.block_duration(&self.config.ddos);
            self.blocklist.block(src, "ddos pattern detected", Some(duration));
            self.counters.inc(names::DDOS_MITIGATED_TOTAL, &[("reason", reason.label())]);
            return Err(self.deny(Tier::Ddos, src, identity));
        }

        Ok(())
    }

    /// Exponential backoff insertion into the blocklist once an identity's
    /// consecutive violation count reaches `block_threshold`.
    fn maybe_block(&self, src: IpAddr, violations: u32) {
        if violations < self.config.block_threshold {
            return;
        }
        let exponent = violations - self.config.block_threshold;
        let backoff_ms = (self.config.backoff_base_ms as f64
            * self.config.backoff_multiplier.powi(exponent as i32))
        .min(self.config.backoff_cap_ms as f64) as u64;
        self.blocklist.block(src, "rate limit violations", Some(Duration::from_millis(backoff_ms)));
    }

    fn deny(&self, tier: Tier, _src: IpAddr, _identity: &str) -> FlowError {
        FlowError::RateLimitExceeded { tier: tier.label().to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            global_rps: 1000,
            global_burst: 1000,
            per_identity_rps: 2,
            per_identity_burst: 2,
            expensive_endpoints: vec![],
            quota_per_hour: 100_000,
            quota_per_day: 1_000_000,
            block_threshold: 2,
            backoff_base_ms: 10,
            backoff_multiplier: 2.0,
            backoff_cap_ms: 1000,
            whitelist: vec![],
            ddos: crate::config::DdosConfig {
                enabled: false,
                window_secs: 10,
                rate_threshold: 1000,
                distinct_endpoints_cap: 1000,
                distinct_user_agents_cap: 1000,
                severe_multiplier: 2.0,
                moderate_block_secs: 3600,
                severe_block_secs: 86400,
            },
            bucket_idle_secs: 600,
        }
    }

    #[test]
    fn test_identity_tier_denies_after_burst() {
        let limiter = RateLimiter::new(config(), Blocklist::new());
        assert!(limiter.check(ip(), "alice", "/x").is_ok());
        assert!(limiter.check(ip(), "alice", "/x").is_ok());
        assert!(matches!(limiter.check(ip(), "alice", "/x"), Err(FlowError::RateLimitExceeded { .. })));
    }

    #[test]
    fn test_override_applies_to_newly_created_identity_bucket() {
        let limiter = RateLimiter::new(config(), Blocklist::new());
        limiter.apply_overrides(&[crate::controlplane::RateLimitOverride {
            target_id: "alice".into(),
            rps: 100,
            burst: 100,
        }]);

        // Default per_identity_burst is 2; the override raises alice's cap
        // well above that, so this identity should not be denied.
        for _ in 0..10 {
            assert!(limiter.check(ip(), "alice", "/x").is_ok());
        }
        // An identity without an override keeps using the configured default.
        assert!(limiter.check(ip(), "bob", "/x").is_ok());
        assert!(limiter.check(ip(), "bob", "/x").is_ok());
        assert!(matches!(limiter.check(ip(), "bob", "/x"), Err(FlowError::RateLimitExceeded { .. })));
    }

    #[test]
    fn test_whitelist_bypasses_all_tiers() {
        let mut cfg = config();
        cfg.whitelist = vec!["alice".into()];
        let limiter = RateLimiter::new(cfg, Blocklist::new());
        for _ in 0..10 {
            assert!(limiter.check(ip(), "alice", "/x").is_ok());
        }
    }

    #[test]
    fn test_repeated_violations_block_the_source() {
        let limiter = RateLimiter::new(config(), Blocklist::new());
        limiter.check(ip(), "bob", "/x").ok();
        limiter.check(ip(), "bob", "/x").ok();
        // Third and fourth calls are violations; block_threshold is 2.
        limiter.check(ip(), "bob", "/x").ok();
        limiter.check(ip(), "bob", "/x").ok();
        assert!(limiter.blocklist.is_blocked(&ip()));
    }

    #[test]
    fn test_quota_tier_denies_once_hourly_cap_reached() {
        let mut cfg = config();
        cfg.per_identity_rps = 1000;
        cfg.per_identity_burst = 1000;
        cfg.quota_per_hour = 3;
        cfg.quota_per_day = 1000;
        let limiter = RateLimiter::new(cfg, Blocklist::new());
        assert!(limiter.check(ip(), "carol", "/x").is_ok());
        assert!(limiter.check(ip(), "carol", "/x").is_ok());
        assert!(limiter.check(ip(), "carol", "/x").is_ok());
        assert!(matches!(limiter.check(ip(), "carol", "/x"), Err(FlowError::RateLimitExceeded { tier }) if tier == "quota"));
    }

    #[test]
    fn test_ddos_mitigation_blocks_source_and_increments_counter() {
        let mut cfg = config();
        cfg.per_identity_rps = 1000;
        cfg.per_identity_burst = 1000;
        cfg.ddos.enabled = true;
        cfg.ddos.rate_threshold = 2;
        let limiter = RateLimiter::with_counters(cfg, Blocklist::new(), Counters::new());
        limiter.check(ip(), "dave", "/x").ok();
        limiter.check(ip(), "dave", "/x").ok();
        let result = limiter.check(ip(), "dave", "/x");
        assert!(matches!(result, Err(FlowError::RateLimitExceeded { tier }) if tier == "ddos"));
        assert!(limiter.blocklist.is_blocked(&ip()));
        assert_eq!(limiter.counters.get(names::DDOS_MITIGATED_TOTAL, &[("reason", "rate_threshold")]), 1);
    }
}
