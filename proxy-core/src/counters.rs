//! Counter registry and `/metrics` plain-text exposition
//!
//! The counter registry is an opaque sink: every
//! rejection, allow, error, and state transition increments a labeled
//! counter against a fixed set of ground-truth metric names and label sets.
//! This is a small label-keyed atomic-counter map rather than a reuse of an
//! OpenTelemetry metrics pipeline, because the exposition format here is a
//! fixed Prometheus-text contract, not an OTLP exporter.

use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A metric name plus its sorted `label=value` pairs, used as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    name: &'static str,
    labels: Vec<(&'static str, String)>,
}

impl CounterKey {
    fn render_labels(&self) -> String {
        if self.labels.is_empty() {
            return String::new();
        }
        let mut out = String::from("{");
        for (i, (k, v)) in self.labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{k}=\"{v}\"");
        }
        out.push('}');
        out
    }
}

/// Process-wide counter registry. Cheap to clone (shares the underlying map).
#[derive(Clone, Default)]
pub struct Counters {
    inner: Arc<DashMap<CounterKey, AtomicU64>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1, creating it on first use.
    pub fn inc(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        self.add(name, labels, 1);
    }

    pub fn add(&self, name: &'static str, labels: &[(&'static str, &str)], delta: u64) {
        let key = CounterKey {
            name,
            labels: labels.iter().map(|(k, v)| (*k, (*v).to_string())).collect(),
        };
        self.inner.entry(key).or_insert_with(|| AtomicU64::new(0)).fetch_add(delta, Ordering::Relaxed);
    }

    /// Set a gauge-style metric (e.g. `proxy_active_connections`) to an
    /// absolute value rather than incrementing it.
    pub fn set(&self, name: &'static str, labels: &[(&'static str, &str)], value: u64) {
        let key = CounterKey {
            name,
            labels: labels.iter().map(|(k, v)| (*k, (*v).to_string())).collect(),
        };
        self.inner.entry(key).or_insert_with(|| AtomicU64::new(0)).store(value, Ordering::Relaxed);
    }

    pub fn get(&self, name: &'static str, labels: &[(&'static str, &str)]) -> u64 {
        let key = CounterKey {
            name,
            labels: labels.iter().map(|(k, v)| (*k, (*v).to_string())).collect(),
        };
        self.inner.get(&key).map(|v| v.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Render every counter as Prometheus plain-text exposition: one metric
    /// per line, `name{k="v",...} value`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in self.inner.iter() {
            let key = entry.key();
            let value = entry.value().load(Ordering::Relaxed);
            let _ = writeln!(out, "{}{} {}", key.name, key.render_labels(), value);
        }
        out
    }
}

/// Names used across the data-plane, kept in one place so callers can't
/// typo a label set out of sync with the ground-truth metric contract.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const PROXY_ACTIVE_CONNECTIONS: &str = "proxy_active_connections";
    pub const UPSTREAM_REQUESTS_TOTAL: &str = "upstream_requests_total";
    pub const UPSTREAM_ERRORS_TOTAL: &str = "upstream_errors_total";
    pub const BACKEND_HEALTH_STATUS: &str = "backend_health_status";
    pub const CIRCUITBREAKER_STATE: &str = "circuitbreaker_state";
    pub const RATELIMIT_REQUESTS_TOTAL: &str = "ratelimit_requests_total";
    pub const RATELIMIT_BLOCKED_TOTAL: &str = "ratelimit_blocked_total";
    pub const WAF_REQUESTS_TOTAL: &str = "waf_requests_total";
    pub const WAF_BLOCKED_TOTAL: &str = "waf_blocked_total";
    pub const TLS_HANDSHAKES_TOTAL: &str = "tls_handshakes_total";
    pub const AUTH_ATTEMPTS_TOTAL: &str = "auth_attempts_total";
    pub const DDOS_MITIGATED_TOTAL: &str = "ddos_mitigated_total";
    pub const DENIED_TOTAL: &str = "denied_total";
    pub const SYNC_ERRORS_TOTAL: &str = "sync_errors_total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_and_get() {
        let c = Counters::new();
        c.inc(names::AUTH_ATTEMPTS_TOTAL, &[("method", "jwt"), ("result", "fail")]);
        c.inc(names::AUTH_ATTEMPTS_TOTAL, &[("method", "jwt"), ("result", "fail")]);
        assert_eq!(c.get(names::AUTH_ATTEMPTS_TOTAL, &[("method", "jwt"), ("result", "fail")]), 2);
    }

    #[test]
    fn test_independent_label_sets_are_independent() {
        let c = Counters::new();
        c.inc(names::AUTH_ATTEMPTS_TOTAL, &[("method", "jwt"), ("result", "fail")]);
        c.inc(names::AUTH_ATTEMPTS_TOTAL, &[("method", "jwt"), ("result", "ok")]);
        assert_eq!(c.get(names::AUTH_ATTEMPTS_TOTAL, &[("method", "jwt"), ("result", "fail")]), 1);
        assert_eq!(c.get(names::AUTH_ATTEMPTS_TOTAL, &[("method", "jwt"), ("result", "ok")]), 1);
    }

    #[test]
    fn test_render_format() {
        let c = Counters::new();
        c.inc(names::PROXY_ACTIVE_CONNECTIONS, &[]);
        let rendered = c.render();
        assert!(rendered.contains("proxy_active_connections"));
        assert!(rendered.trim_end().ends_with('1'));
    }

    #[test]
    fn test_set_overwrites_rather_than_accumulates() {
        let c = Counters::new();
        c.set(names::PROXY_ACTIVE_CONNECTIONS, &[], 5);
        c.set(names::PROXY_ACTIVE_CONNECTIONS, &[], 3);
        assert_eq!(c.get(names::PROXY_ACTIVE_CONNECTIONS, &[]), 3);
    }

    #[test]
    fn test_requests_total_equals_allowed_plus_blocked_plus_error() {
        // allowed + blocked + error must always equal requests_total.
        let c = Counters::new();
        c.inc(names::RATELIMIT_REQUESTS_TOTAL, &[("client_type", "ip"), ("result", "allowed")]);
        c.inc(names::RATELIMIT_REQUESTS_TOTAL, &[("client_type", "ip"), ("result", "allowed")]);
        c.inc(names::RATELIMIT_REQUESTS_TOTAL, &[("client_type", "ip"), ("result", "blocked")]);
        c.inc(names::RATELIMIT_REQUESTS_TOTAL, &[("client_type", "ip"), ("result", "error")]);

        let allowed = c.get(names::RATELIMIT_REQUESTS_TOTAL, &[("client_type", "ip"), ("result", "allowed")]);
        let blocked = c.get(names::RATELIMIT_REQUESTS_TOTAL, &[("client_type", "ip"), ("result", "blocked")]);
        let error = c.get(names::RATELIMIT_REQUESTS_TOTAL, &[("client_type", "ip"), ("result", "error")]);
        assert_eq!(allowed + blocked + error, 4);
    }
}
