//! Rule data model and fast-path eligibility
//!
//! A `Rule` is the control-plane's unit of policy. At sync time each rule is
//! classified into the fast table (`FastPathRule`) or the slow table
//! (`SlowPathRule`) — see [`Rule::is_fast_path_eligible`] and
//! [`Rule::expand_fast_path`].

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::ids::RuleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    None,
    Jwt,
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

/// A port selector on a rule: a single port, an inclusive range, or an
/// explicit list. All three expand to one or more concrete ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSelector {
    Single(u16),
    Range { from: u16, to: u16 },
    List(Vec<u16>),
}

impl PortSelector {
    /// Concrete ports this selector expands to.
    ///
    /// Both a range and a list expand eagerly at classification-build time
    /// (DESIGN.md open question 3), so the fast-path lookup key is always a
    /// single concrete port rather than a range comparison.
    pub fn expand(&self) -> Vec<u16> {
        match self {
            PortSelector::Single(p) => vec![*p],
            PortSelector::Range { from, to } => (*from..=*to).collect(),
            PortSelector::List(ports) => ports.clone(),
        }
    }

    /// True when this selector names exactly one port — required for
    /// fast-path eligibility, since the fast table has no header routing
    /// and must resolve to exactly one destination per key.
    pub fn is_single(&self) -> bool {
        match self {
            PortSelector::Single(_) => true,
            PortSelector::Range { from, to } => from == to,
            PortSelector::List(ports) => ports.len() == 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Drop,
    Escalate,
}

/// A source CIDR/host match. `None` host means "any source" (wildcard).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMatch {
    pub cidr: Option<String>,
}

impl SourceMatch {
    pub fn is_wildcard(&self) -> bool {
        self.cidr.is_none()
    }
}

/// A policy rule as delivered by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub source: SourceMatch,
    pub destinations: Vec<Destination>,
    pub ports: PortSelector,
    pub protocol: Protocol,
    pub auth: AuthMode,
    pub tls: bool,
    pub header_routing: bool,
    pub action: RuleAction,
    pub priority: i32,
}

impl Rule {
    /// A rule is fast-path eligible when it needs no
    /// authentication, no TLS termination, resolves to a single
    /// destination, and does no header-based routing. A port range or list
    /// is still eligible — it expands to one fast-path entry per concrete
    /// port (see [`Rule::expand_fast_path`]), keeping every fast-table key
    /// a single port rather than a range comparison.
    pub fn is_fast_path_eligible(&self) -> bool {
        self.auth == AuthMode::None
            && !self.tls
            && !self.header_routing
            && self.destinations.len() == 1
    }

    /// Expand this rule into zero or more concrete fast-path entries, one
    /// per port. Returns an empty vec if the rule is not fast-path
    /// eligible — callers should route those into the slow table instead.
    pub fn expand_fast_path(&self) -> Vec<FastPathRule> {
        if !self.is_fast_path_eligible() {
            return Vec::new();
        }
        let dest = self.destinations[0].clone();
        self.ports
            .expand()
            .into_iter()
            .map(|port| FastPathRule {
                rule_id: self.id.clone(),
                source_cidr: self.source.cidr.clone(),
                dst_port: port,
                protocol: self.protocol,
                action: self.action,
                destination: dest.clone(),
                priority: self.priority,
            })
            .collect()
    }

    pub fn to_slow_path(&self) -> SlowPathRule {
        SlowPathRule {
            rule_id: self.id.clone(),
            source_cidr: self.source.cidr.clone(),
            ports: self.ports.clone(),
            protocol: self.protocol,
            auth: self.auth,
            tls: self.tls,
            header_routing: self.header_routing,
            destinations: self.destinations.clone(),
            action: self.action,
            priority: self.priority,
        }
    }
}

/// A single concrete (source, port, protocol) → destination mapping. The
/// unit of the fast table's keyed lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastPathRule {
    pub rule_id: RuleId,
    pub source_cidr: Option<String>,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub action: RuleAction,
    pub destination: Destination,
    pub priority: i32,
}

/// A rule retained in full for the slow path: auth required, TLS
/// termination, multiple destinations, or header-based routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowPathRule {
    pub rule_id: RuleId,
    pub source_cidr: Option<String>,
    pub ports: PortSelector,
    pub protocol: Protocol,
    pub auth: AuthMode,
    pub tls: bool,
    pub header_routing: bool,
    pub destinations: Vec<Destination>,
    pub action: RuleAction,
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_rule() -> Rule {
        Rule {
            id: RuleId::new(),
            source: SourceMatch { cidr: None },
            destinations: vec![Destination { host: "10.0.0.1".into(), port: 443 }],
            ports: PortSelector::Single(443),
            protocol: Protocol::Tcp,
            auth: AuthMode::None,
            tls: false,
            header_routing: false,
            action: RuleAction::Allow,
            priority: 0,
        }
    }

    #[test]
    fn test_fast_path_eligible_rule() {
        let r = base_rule();
        assert!(r.is_fast_path_eligible());
        assert_eq!(r.expand_fast_path().len(), 1);
    }

    #[test]
    fn test_auth_disqualifies_fast_path() {
        let mut r = base_rule();
        r.auth = AuthMode::Jwt;
        assert!(!r.is_fast_path_eligible());
        assert!(r.expand_fast_path().is_empty());
    }

    #[test]
    fn test_tls_disqualifies_fast_path() {
        let mut r = base_rule();
        r.tls = true;
        assert!(!r.is_fast_path_eligible());
    }

    #[test]
    fn test_multi_destination_disqualifies_fast_path() {
        let mut r = base_rule();
        r.destinations.push(Destination { host: "10.0.0.2".into(), port: 443 });
        assert!(!r.is_fast_path_eligible());
    }

    #[test]
    fn test_port_range_expands_to_one_entry_per_port() {
        let mut r = base_rule();
        r.ports = PortSelector::Range { from: 8000, to: 8002 };
        assert!(r.is_fast_path_eligible());
        let expanded = r.expand_fast_path();
        assert_eq!(expanded.len(), 3);
        assert_eq!(
            expanded.iter().map(|e| e.dst_port).collect::<Vec<_>>(),
            vec![8000, 8001, 8002]
        );
    }

    #[test]
    fn test_port_list_multi_entry_eligible() {
        let mut r = base_rule();
        r.ports = PortSelector::List(vec![80, 8080, 8443]);
        assert!(r.is_fast_path_eligible());
        let expanded = r.expand_fast_path();
        assert_eq!(expanded.len(), 3);
    }

    #[test]
    fn test_port_list_single_entry_eligible() {
        let mut r = base_rule();
        r.ports = PortSelector::List(vec![443]);
        assert!(r.is_fast_path_eligible());
        let expanded = r.expand_fast_path();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].dst_port, 443);
    }

    #[test]
    fn test_header_routing_forces_slow_path() {
        let mut r = base_rule();
        r.header_routing = true;
        assert!(!r.is_fast_path_eligible());
    }
}
