//! Rule synchronizer: poll the control plane, classify, and publish
//!
//! A periodic task (default interval 30s) that fetches the current
//! services/mappings, joins them into rules, validates the batch, classifies
//! each rule onto the fast or slow path, and publishes a new generation.
//! Exponential backoff on failure is capped at the poll interval. Never
//! publishes a partial generation — a failed fetch, join, or validation
//! failure leaves the previous generation in place.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::controlplane::{self, ControlPlaneClient, GetConfigurationRequest};
use crate::counters::{names, Counters};
use crate::error::Error;
use crate::ratelimit::RateLimiter;
use crate::rules::generation::{GenerationStore, RuleGeneration};
use crate::rules::model::Rule;
use crate::slowpath::tls;
use crate::state::TlsMaterialStore;

pub struct Synchronizer {
    client: Arc<dyn ControlPlaneClient>,
    store: GenerationStore,
    counters: Counters,
    poll_interval: Duration,
    max_backoff: Duration,
    max_rules: usize,
    last_version: AtomicU64,
    running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    rate_limiter: Option<Arc<RateLimiter>>,
    tls_store: Option<TlsMaterialStore>,
}

impl Synchronizer {
    pub fn new(
        client: Arc<dyn ControlPlaneClient>,
        store: GenerationStore,
        counters: Counters,
        config: &Config,
    ) -> Self {
        let poll_interval = config.control_plane.sync_interval();
        let max_backoff = config.control_plane.max_backoff();
        Self {
            client,
            store,
            counters,
            poll_interval,
            max_backoff,
            max_rules: config.control_plane.max_rules,
            last_version: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            rate_limiter: None,
            tls_store: None,
        }
    }

    /// Apply control-plane `rateLimitOverrides` to this rate limiter as
    /// they arrive on each sync.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Rebuild the live TLS `ServerConfig` from control-plane
    /// `certificates[]` as they arrive on each sync.
    pub fn with_tls_store(mut self, tls_store: TlsMaterialStore) -> Self {
        self.tls_store = Some(tls_store);
        self
    }

    pub fn current_generation(&self) -> Arc<RuleGeneration> {
        self.store.current()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawn the periodic sync loop, returning a handle the caller can
    /// await during shutdown.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::Relaxed);
        tokio::spawn(async move {
            let mut backoff = self.poll_interval;
            loop {
                let sync_result = self.sync_once().await;
                backoff = match sync_result {
                    Ok(()) => self.poll_interval,
                    Err(e) => {
                        tracing::warn!(error = %e, "rule sync failed, backing off");
                        self.counters.inc(names::SYNC_ERRORS_TOTAL, &[]);
                        std::cmp::min(backoff * 2, self.max_backoff)
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.stop_signal.notified() => break,
                }
            }
            self.running.store(false, Ordering::Relaxed);
        })
    }

    pub fn stop(&self) {
        self.stop_signal.notify_one();
    }

    async fn sync_once(&self) -> crate::error::Result<()> {
        let last_version = self.last_version.load(Ordering::Relaxed);
        let response = self
            .client
            .get_configuration(GetConfigurationRequest { last_version: Some(last_version) })
            .await?;

        let (Some(services), Some(mappings)) = (response.services, response.mappings) else {
            // No change since last_version: nothing to classify or publish.
            return Ok(());
        };

        let rules = controlplane::build_rules(&services, &mappings);
        validate_rules(&rules, self.max_rules)?;

        let mut fast = Vec::new();
        let mut slow = Vec::new();
        for rule in &rules {
            if rule.is_fast_path_eligible() {
                fast.extend(rule.expand_fast_path());
            } else {
                slow.push(rule.to_slow_path());
            }
        }

        let generation = RuleGeneration::build(response.version, fast, slow);
        self.store.publish(generation);
        self.last_version.store(response.version, Ordering::Relaxed);

        tracing::info!(
            version = response.version,
            fast_entries = self.store.current().fast_table_len(),
            slow_entries = self.store.current().slow_table().len(),
            "published new rule generation"
        );

        if let (Some(certificates), Some(tls_store)) = (response.certificates.as_ref(), self.tls_store.as_ref()) {
            if !certificates.is_empty() {
                match tls::build_server_config_from_certificates(certificates, None) {
                    Ok(server_config) => tls_store.publish(server_config),
                    Err(e) => tracing::warn!(error = %e, "failed to load control-plane certificates, keeping prior TLS material"),
                }
            }
        }

        if let (Some(overrides), Some(rate_limiter)) = (response.rate_limit_overrides.as_ref(), self.rate_limiter.as_ref()) {
            rate_limiter.apply_overrides(overrides);
        }

        Ok(())
    }
}

/// A source match string is either a bare IP (exact-match against the
/// fast/slow tables, see `rules::generation`) or an `ip/prefix` pair.
fn is_well_formed_cidr(cidr: &str) -> bool {
    match cidr.split_once('/') {
        Some((addr, prefix)) => {
            addr.parse::<std::net::IpAddr>().is_ok()
                && prefix.parse::<u8>().map(|p| p <= 128).unwrap_or(false)
        }
        None => cidr.parse::<std::net::IpAddr>().is_ok(),
    }
}

/// Reject a fetched rule set before it is classified and published.
/// Catches a malformed or oversized control-plane response so the previous
/// generation stays in effect rather than serving a broken one.
fn validate_rules(rules: &[Rule], max_rules: usize) -> Result<(), Error> {
    if rules.len() > max_rules {
        return Err(Error::ControlPlane(format!(
            "fetched {} rules, exceeds max_rules {}",
            rules.len(),
            max_rules
        )));
    }

    let mut seen_ids = HashSet::with_capacity(rules.len());
    for rule in rules {
        if !seen_ids.insert(rule.id.clone()) {
            return Err(Error::ControlPlane(format!("duplicate rule id {}", rule.id)));
        }

        if rule.destinations.is_empty() {
            return Err(Error::ControlPlane(format!("rule {} has no destinations", rule.id)));
        }
        for dest in &rule.destinations {
            if dest.host.trim().is_empty() {
                return Err(Error::ControlPlane(format!("rule {} has an empty destination host", rule.id)));
            }
            if dest.port == 0 {
                return Err(Error::ControlPlane(format!("rule {} has an invalid destination port 0", rule.id)));
            }
        }

        for port in rule.ports.expand() {
            if port == 0 {
                return Err(Error::ControlPlane(format!("rule {} selects invalid port 0", rule.id)));
            }
        }

        if let Some(cidr) = &rule.source.cidr {
            if !is_well_formed_cidr(cidr) {
                return Err(Error::ControlPlane(format!("rule {} has a malformed source CIDR {cidr}", rule.id)));
            }
        }
    }

    Ok(())
}
