//! DDoS pattern detection
//!
//! Tracks a rolling `TrafficPattern` per source IP — request
//! rate, distinct endpoints touched, distinct user agents seen — and flags
//! the source for mitigation once any cap is exceeded within the window.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::config::DdosConfig;

#[derive(Debug)]
pub struct TrafficPattern {
    window_start: Instant,
    request_count: u32,
    endpoints: HashSet<String>,
    user_agents: HashSet<String>,
}

impl TrafficPattern {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            request_count: 0,
            endpoints: HashSet::new(),
            user_agents: HashSet::new(),
        }
    }

    fn reset_if_expired(&mut self, window: Duration) {
        if self.window_start.elapsed() >= window {
            *self = Self::new();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitigationReason {
    RateThreshold,
    EndpointFanOut,
    UserAgentFanOut,
}

impl MitigationReason {
    pub fn label(self) -> &'static str {
        match self {
            MitigationReason::RateThreshold => "rate_threshold",
            MitigationReason::EndpointFanOut => "endpoint_fan_out",
            MitigationReason::UserAgentFanOut => "user_agent_fan_out",
        }
    }
}

/// How hard to mitigate a flagged source: `rate_threshold` breaches scale
/// with how far over the threshold the source is, fan-out breaches are
/// always moderate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Moderate,
    Severe,
}

impl Severity {
    pub fn block_duration(self, config: &DdosConfig) -> Duration {
        match self {
            Severity::Moderate => Duration::from_secs(config.moderate_block_secs),
            Severity::Severe => Duration::from_secs(config.severe_block_secs),
        }
    }
}

pub struct DdosDetector {
    config: DdosConfig,
    patterns: dashmap::DashMap<std::net::IpAddr, TrafficPattern>,
}

impl DdosDetector {
    pub fn new(config: DdosConfig) -> Self {
        Self { config, patterns: dashmap::DashMap::new() }
    }

    /// Record one request and return a mitigation reason + severity if this
    /// source now exceeds any configured cap within the rolling window.
    /// A rate-threshold breach is `Severe` once the request count reaches
    /// `severe_multiplier * rate_threshold`, `Moderate` otherwise; fan-out
    /// breaches are always `Moderate`.
    pub fn observe(&self, src: std::net::IpAddr, endpoint: &str, user_agent: Option<&str>) -> Option<(MitigationReason, Severity)> {
        if !self.config.enabled {
            return None;
        }
        let window = Duration::from_secs(self.config.window_secs);
        let mut pattern = self.patterns.entry(src).or_insert_with(TrafficPattern::new);
        pattern.reset_if_expired(window);

        pattern.request_count += 1;
        pattern.endpoints.insert(endpoint.to_string());
        if let Some(ua) = user_agent {
            pattern.user_agents.insert(ua.to_string());
        }

        if pattern.request_count > self.config.rate_threshold {
            let severe_at = (self.config.rate_threshold as f64 * self.config.severe_multiplier) as u32;
            let severity = if pattern.request_count >= severe_at { Severity::Severe } else { Severity::Moderate };
            return Some((MitigationReason::RateThreshold, severity));
        }
        if pattern.endpoints.len() as u32 > self.config.distinct_endpoints_cap {
            return Some((MitigationReason::EndpointFanOut, Severity::Moderate));
        }
        if pattern.user_agents.len() as u32 > self.config.distinct_user_agents_cap {
            return Some((MitigationReason::UserAgentFanOut, Severity::Moderate));
        }
        None
    }
}
