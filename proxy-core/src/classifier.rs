//! Fast-path classifier
//!
//! O(1) keyed lookup on the current rule generation deciding
//! allow/drop/escalate for a connection's opening packet, without touching
//! the slow path's per-flow state machine.

use std::net::IpAddr;

use crate::rules::model::{Destination, Protocol, RuleAction};
use crate::rules::RuleGeneration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow(Destination),
    /// Dropped with a reason label for the `denied{reason=...}` counter —
    /// `"fast_path_drop"` for an explicit fast-table drop rule,
    /// `"no_rule"` when no slow-path rule could possibly cover this flow
    /// either.
    Drop(&'static str),
    /// Some slow-path rule might cover this flow; hand it to the slow path
    /// for a full per-flow decision.
    Escalate,
}

/// Classify a single connection attempt against a generation snapshot.
///
/// Exact-source entries win over wildcard-source entries for the same
/// (port, protocol) key. A fast-table miss no longer always
/// escalates: if no slow-path rule names this (port, protocol) for any
/// source either, nothing downstream could ever match it, so it drops in
/// O(1) via the generation's slow-path coverage index rather than paying
/// for an escalation that the slow path's linear scan would reject anyway.
pub fn classify(generation: &RuleGeneration, src: IpAddr, dst_port: u16, protocol: Protocol) -> Verdict {
    match generation.fast_lookup(src, dst_port, protocol) {
        Some(rule) => match rule.action {
            RuleAction::Allow => Verdict::Allow(rule.destination.clone()),
            RuleAction::Drop => Verdict::Drop("fast_path_drop"),
            RuleAction::Escalate => Verdict::Escalate,
        },
        None if generation.could_match_slow(dst_port, protocol) => Verdict::Escalate,
        None => Verdict::Drop("no_rule"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RuleId;
    use crate::rules::model::FastPathRule;
    use std::net::Ipv4Addr;

    fn gen_with(rules: Vec<FastPathRule>) -> RuleGeneration {
        RuleGeneration::build(1, rules, vec![])
    }

    fn rule(action: RuleAction, dst_port: u16) -> FastPathRule {
        FastPathRule {
            rule_id: RuleId::new(),
            source_cidr: None,
            dst_port,
            protocol: Protocol::Tcp,
            action,
            destination: Destination { host: "10.0.0.1".into(), port: 443 },
            priority: 0,
        }
    }

    #[test]
    fn test_allow_returns_destination() {
        let generation = gen_with(vec![rule(RuleAction::Allow, 443)]);
        let verdict = classify(&generation, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 443, Protocol::Tcp);
        assert_eq!(verdict, Verdict::Allow(Destination { host: "10.0.0.1".into(), port: 443 }));
    }

    #[test]
    fn test_drop_returns_drop() {
        let generation = gen_with(vec![rule(RuleAction::Drop, 443)]);
        let verdict = classify(&generation, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 443, Protocol::Tcp);
        assert_eq!(verdict, Verdict::Drop("fast_path_drop"));
    }

    #[test]
    fn test_unmatched_key_with_no_slow_coverage_drops() {
        let generation = gen_with(vec![]);
        let verdict = classify(&generation, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 9999, Protocol::Tcp);
        assert_eq!(verdict, Verdict::Drop("no_rule"));
    }

    #[test]
    fn test_unmatched_key_with_slow_coverage_escalates() {
        use crate::ids::RuleId;
        use crate::rules::model::{AuthMode, Destination as Dest, PortSelector, SlowPathRule};

        let slow = SlowPathRule {
            rule_id: RuleId::new(),
            source_cidr: None,
            ports: PortSelector::Single(9999),
            protocol: Protocol::Tcp,
            auth: AuthMode::Jwt,
            tls: false,
            header_routing: false,
            destinations: vec![Dest { host: "10.0.0.1".into(), port: 443 }],
            action: RuleAction::Allow,
            priority: 0,
        };
        let generation = RuleGeneration::build(1, vec![], vec![slow]);
        let verdict = classify(&generation, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 9999, Protocol::Tcp);
        assert_eq!(verdict, Verdict::Escalate);
    }
}
