//! Web application firewall
//!
//! Combines the rule engine, anomaly detector, geo blocker,
//! and IP reputation cache into one inspection score, compared against a
//! configured blocking threshold. Three modes: `detection` (score but never
//! block), `prevention` (block at threshold), `bypass` (skip inspection
//! entirely).

pub mod anomaly;
pub mod geo;
pub mod reputation;
pub mod rules;

use std::net::IpAddr;
use std::sync::Mutex;

use dashmap::DashMap;

use crate::config::WafConfig;
use crate::error::FlowError;
use anomaly::AnomalyDetector;
use geo::GeoBlocker;
use reputation::ReputationCache;
use rules::RuleEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WafMode {
    Detection,
    Prevention,
    Bypass,
}

impl WafMode {
    pub fn parse(s: &str) -> WafMode {
        match s {
            "detection" => WafMode::Detection,
            "bypass" => WafMode::Bypass,
            _ => WafMode::Prevention,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InspectionResult {
    pub score: u32,
    pub matched_categories: Vec<String>,
    pub blocked: bool,
}

/// Per-identity registry of anomaly detectors. Each identity gets its own
/// sliding window so one noisy identity's baseline doesn't suppress scoring
/// for everyone else, mirroring the keyed-cache shape already used by
/// [`ReputationCache`] and [`crate::blocklist::Blocklist`].
struct AnomalyRegistry {
    window: std::time::Duration,
    spike_multiplier: f64,
    max_score: u32,
    detectors: DashMap<String, Mutex<AnomalyDetector>>,
}

impl AnomalyRegistry {
    fn new(config: &WafConfig) -> Self {
        Self {
            window: config.anomaly_window(),
            spike_multiplier: config.anomaly_spike_multiplier,
            max_score: config.anomaly_max_score,
            detectors: DashMap::new(),
        }
    }

    fn score(&self, identity: &str) -> u32 {
        let entry = self
            .detectors
            .entry(identity.to_string())
            .or_insert_with(|| Mutex::new(AnomalyDetector::new(self.window, self.spike_multiplier, self.max_score)));
        let mut detector = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        detector.record_and_score()
    }
}

pub struct Waf {
    mode: WafMode,
    threshold: u32,
    rule_engine: Option<RuleEngine>,
    anomaly: Option<AnomalyRegistry>,
    geo: GeoBlocker,
    reputation: ReputationCache,
    reputation_enabled: bool,
}

impl Waf {
    pub fn new(config: &WafConfig, reputation: ReputationCache) -> Self {
        Self {
            mode: WafMode::parse(&config.mode),
            threshold: config.blocking_threshold,
            rule_engine: config.rule_engine_enabled.then(RuleEngine::baseline),
            anomaly: config.anomaly_detector_enabled.then(|| AnomalyRegistry::new(config)),
            geo: if config.geo_blocker_enabled {
                GeoBlocker::new(config.geo_allow_list.clone(), config.geo_block_list.clone())
            } else {
                GeoBlocker::new(vec![], vec![])
            },
            reputation,
            reputation_enabled: config.reputation_enabled,
        }
    }

    /// Inspect one request. `identity` keys the per-identity anomaly
    /// baseline (the identity cascade — API key, user id, token
    /// prefix, or source IP, whichever the caller resolved). `country` is
    /// the caller's resolved geo code, if known. Returns
    /// `Err(FlowError::WafBlocked)` only in `prevention` mode once
    /// `threshold` is met or exceeded.
    pub fn inspect(&self, input: &str, src: IpAddr, identity: &str, country: Option<&str>) -> Result<InspectionResult, FlowError> {
        if self.mode == WafMode::Bypass {
            return Ok(InspectionResult { score: 0, matched_categories: vec![], blocked: false });
        }

        if let Some(country) = country {
            if self.geo.is_blocked(country) {
                let result = InspectionResult { score: self.threshold, matched_categories: vec!["geo".into()], blocked: true };
                if self.mode == WafMode::Prevention {
                    return Err(FlowError::WafBlocked { score: result.score, threshold: self.threshold });
                }
                return Ok(result);
            }
        }

        let mut score = 0u32;
        let mut matched_categories = Vec::new();

        if let Some(engine) = &self.rule_engine {
            for m in engine.evaluate(input) {
                score += m.severity.weight();
                matched_categories.push(m.category);
            }
        }

        if let Some(anomaly) = &self.anomaly {
            let anomaly_score = anomaly.score(identity);
            if anomaly_score > 0 {
                score += anomaly_score;
                matched_categories.push("anomaly".into());
            }
        }

        if self.reputation_enabled {
            if let Some(rep_score) = self.reputation.get(&src) {
                score += rep_score;
                if rep_score > 0 {
                    matched_categories.push("reputation".into());
                }
            }
        }

        let blocked = score >= self.threshold;
        if blocked && self.mode == WafMode::Prevention {
            return Err(FlowError::WafBlocked { score, threshold: self.threshold });
        }

        Ok(InspectionResult { score, matched_categories, blocked })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn waf(mode: &str, threshold: u32) -> Waf {
        let config = WafConfig {
            mode: mode.to_string(),
            blocking_threshold: threshold,
            rule_engine_enabled: true,
            anomaly_detector_enabled: false,
            geo_blocker_enabled: false,
            geo_allow_list: vec![],
            geo_block_list: vec![],
            reputation_enabled: false,
            reputation_ttl_secs: 300,
            anomaly_window_secs: 60,
            anomaly_spike_multiplier: 3.0,
            anomaly_max_score: 40,
        };
        Waf::new(&config, ReputationCache::new(Duration::from_secs(300)))
    }

    #[test]
    fn test_prevention_mode_blocks_over_threshold() {
        let w = waf("prevention", 10);
        let result = w.inspect("UNION SELECT * FROM users", IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "198.51.100.1", None);
        assert!(matches!(result, Err(FlowError::WafBlocked { .. })));
    }

    #[test]
    fn test_detection_mode_never_blocks() {
        let w = waf("detection", 10);
        let result = w.inspect("UNION SELECT * FROM users", IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "198.51.100.1", None).unwrap();
        assert!(result.blocked);
    }

    #[test]
    fn test_bypass_mode_skips_inspection() {
        let w = waf("bypass", 1);
        let result = w.inspect("UNION SELECT * FROM users", IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "198.51.100.1", None).unwrap();
        assert_eq!(result.score, 0);
    }

    #[test]
    fn test_clean_input_under_threshold_passes() {
        let w = waf("prevention", 100);
        let result = w.inspect("/api/v1/health", IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "198.51.100.1", None).unwrap();
        assert!(!result.blocked);
    }

    #[test]
    fn test_anomaly_detector_contributes_score_when_enabled() {
        let config = WafConfig {
            mode: "detection".to_string(),
            blocking_threshold: 1_000,
            rule_engine_enabled: false,
            anomaly_detector_enabled: true,
            geo_blocker_enabled: false,
            geo_allow_list: vec![],
            geo_block_list: vec![],
            reputation_enabled: false,
            reputation_ttl_secs: 300,
            anomaly_window_secs: 60,
            anomaly_spike_multiplier: 1.0,
            anomaly_max_score: 40,
        };
        let w = Waf::new(&config, ReputationCache::new(Duration::from_secs(300)));
        let ip = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let mut last = w.inspect("clean", ip, "user-1", None).unwrap();
        for _ in 0..30 {
            last = w.inspect("clean", ip, "user-1", None).unwrap();
        }
        assert!(last.score > 0);
        assert!(last.matched_categories.contains(&"anomaly".to_string()));
    }
}
