//! WAF regex rule engine
//!
//! Rules are grouped by category (e.g. `sqli`, `xss`,
//! `traversal`), each carrying a severity weight; a match contributes its
//! weight to the request's total score, and the matched substring is kept
//! as evidence, truncated to at most 100 bytes so a pathological payload
//! can't balloon a log line.

use regex::Regex;
use serde::{Deserialize, Serialize};

const EVIDENCE_MAX_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn weight(self) -> u32 {
        match self {
            Severity::Low => 5,
            Severity::Medium => 15,
            Severity::High => 30,
            Severity::Critical => 60,
        }
    }
}

pub struct WafRule {
    pub category: &'static str,
    pub severity: Severity,
    pattern: Regex,
}

impl WafRule {
    pub fn new(category: &'static str, severity: Severity, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self { category, severity, pattern: Regex::new(pattern)? })
    }
}

#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub category: String,
    pub severity: Severity,
    pub evidence: String,
}

/// Evaluates a request body/path/query against a fixed rule set, returning
/// every match with truncated evidence.
pub struct RuleEngine {
    rules: Vec<WafRule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<WafRule>) -> Self {
        Self { rules }
    }

    /// The built-in baseline rule set: common SQL injection, XSS, and path
    /// traversal signatures. Real deployments would load these from the
    /// control plane.
    pub fn baseline() -> Self {
        let rules = vec![
            WafRule::new("sqli", Severity::High, r"(?i)(union\s+select|or\s+1\s*=\s*1|;\s*drop\s+table)").unwrap(),
            WafRule::new("xss", Severity::Medium, r"(?i)(<script|onerror\s*=|javascript:)").unwrap(),
            WafRule::new("traversal", Severity::Medium, r"\.\./\.\./").unwrap(),
            WafRule::new("cmdi", Severity::Critical, r"(?i)(;\s*(rm|cat|wget|curl)\s|&&\s*(rm|cat))").unwrap(),
        ];
        Self::new(rules)
    }

    pub fn evaluate(&self, input: &str) -> Vec<RuleMatch> {
        let mut matches = Vec::new();
        for rule in &self.rules {
            if let Some(m) = rule.pattern.find(input) {
                let mut evidence = m.as_str().to_string();
                evidence.truncate(EVIDENCE_MAX_LEN);
                matches.push(RuleMatch {
                    category: rule.category.to_string(),
                    severity: rule.severity,
                    evidence,
                });
            }
        }
        matches
    }

    pub fn score(&self, input: &str) -> u32 {
        self.evaluate(input).iter().map(|m| m.severity.weight()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqli_pattern_matches() {
        let engine = RuleEngine::baseline();
        let matches = engine.evaluate("id=1 UNION SELECT password FROM users");
        assert!(matches.iter().any(|m| m.category == "sqli"));
    }

    #[test]
    fn test_clean_input_has_no_matches() {
        let engine = RuleEngine::baseline();
        assert!(engine.evaluate("/api/v1/users?id=42").is_empty());
    }

    #[test]
    fn test_score_sums_severity_weights() {
        let engine = RuleEngine::baseline();
        let score = engine.score("<script>alert(1)</script> and ../../etc/passwd");
        assert_eq!(score, Severity::Medium.weight() + Severity::Medium.weight());
    }

    #[test]
    fn test_evidence_truncated_to_100_bytes() {
        let rule = WafRule::new("test", Severity::Low, r"a+").unwrap();
        let engine = RuleEngine::new(vec![rule]);
        let long_input = "a".repeat(500);
        let matches = engine.evaluate(&long_input);
        assert_eq!(matches[0].evidence.len(), 100);
    }
}
