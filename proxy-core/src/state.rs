//! Shared application state
//!
//! Non-generic `AppState`: the proxy has no per-consumer custom config
//! extension point, so there's no generic parameter to thread through.
//! `AppStateBuilder` wires in the control-plane client and optional
//! Redis-backed caches without `AppState::new` itself growing a long
//! parameter list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio_rustls::rustls::ServerConfig;

use crate::blocklist::Blocklist;
use crate::compression::CompressionEngine;
use crate::config::Config;
use crate::counters::Counters;
use crate::ratelimit::RateLimiter;
use crate::rules::GenerationStore;
use crate::slowpath::tls::build_default_server_config;
use crate::waf::reputation::ReputationCache;
use crate::waf::Waf;

/// Holds the `ServerConfig` built from control-plane-delivered
/// certificates, swapped in atomically as new ones arrive. Falls back to
/// `AppState`'s static `Config.tls`-derived config when empty.
#[derive(Clone, Default)]
pub struct TlsMaterialStore(Arc<ArcSwapOption<ServerConfig>>);

impl TlsMaterialStore {
    pub fn publish(&self, config: Arc<ServerConfig>) {
        self.0.store(Some(config));
    }

    pub fn current(&self) -> Option<Arc<ServerConfig>> {
        self.0.load_full()
    }
}

/// Application state shared across the admin surface and every flow worker.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    counters: Counters,
    generations: GenerationStore,
    blocklist: Blocklist,
    reputation: ReputationCache,
    waf: Arc<Waf>,
    rate_limiter: Arc<RateLimiter>,
    active_connections: Arc<AtomicUsize>,
    accepting: Arc<std::sync::atomic::AtomicBool>,
    tls_server_config: Option<Arc<ServerConfig>>,
    dynamic_tls: TlsMaterialStore,
    compression: Arc<CompressionEngine>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let waf_ttl = config.waf.reputation_ttl();
        let reputation = ReputationCache::new(waf_ttl);
        let waf = Arc::new(Waf::new(&config.waf, reputation.clone()));
        let blocklist = Blocklist::new();
        let counters = Counters::new();
        let rate_limiter = Arc::new(RateLimiter::with_counters(config.rate_limit.clone(), blocklist.clone(), counters.clone()));
        let tls_server_config = config.tls.as_ref().and_then(|tls| match build_default_server_config(tls) {
            Ok(sc) => Some(sc),
            Err(e) => {
                tracing::error!(error = %e, "failed to load TLS material, TLS-terminating rules will reject");
                None
            }
        });
        Self {
            counters,
            generations: GenerationStore::default(),
            blocklist,
            reputation,
            waf,
            rate_limiter,
            active_connections: Arc::new(AtomicUsize::new(0)),
            accepting: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            tls_server_config,
            dynamic_tls: TlsMaterialStore::default(),
            compression: Arc::new(CompressionEngine::new(config.compression.clone())),
            config: Arc::new(config),
        }
    }

    /// The TLS `ServerConfig` for rules with `tls: true`: control-plane
    /// `certificates[]` once the synchronizer has published one, falling
    /// back to the static `Config.tls`-derived pair.
    pub fn tls_server_config(&self) -> Option<Arc<ServerConfig>> {
        self.dynamic_tls.current().or_else(|| self.tls_server_config.clone())
    }

    pub fn tls_material_store(&self) -> &TlsMaterialStore {
        &self.dynamic_tls
    }

    pub fn compression(&self) -> &Arc<CompressionEngine> {
        &self.compression
    }

    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn generations(&self) -> &GenerationStore {
        &self.generations
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    pub fn reputation(&self) -> &ReputationCache {
        &self.reputation
    }

    pub fn waf(&self) -> &Arc<Waf> {
        &self.waf
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Admission control ceiling check: reject new connections outright
    /// once `max_active_connections` is reached.
    pub fn try_admit(&self) -> bool {
        let ceiling = self.config.service.max_active_connections;
        loop {
            let current = self.active_connections.load(Ordering::Relaxed);
            if current >= ceiling {
                return false;
            }
            if self
                .active_connections
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.counters.set(
                    crate::counters::names::PROXY_ACTIVE_CONNECTIONS,
                    &[],
                    (current + 1) as u64,
                );
                return true;
            }
        }
    }

    pub fn release(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::AcqRel);
        self.counters.set(
            crate::counters::names::PROXY_ACTIVE_CONNECTIONS,
            &[],
            prev.saturating_sub(1) as u64,
        );
    }

    pub fn active_connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }

    /// Backs `/healthz`: true once the accept loop is running and at least
    /// one rule generation has been published.
    pub fn is_healthy(&self) -> bool {
        self.accepting.load(Ordering::Relaxed) && self.generations.current().version > 0
    }
}

/// Builder for [`AppState`], kept separate from `AppState::new` so
/// call sites that only need defaults (tests, `cfg` dry-runs) don't have
/// to construct a full `Config` first.
pub struct AppStateBuilder {
    config: Option<Config>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self { config: None }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> AppState {
        AppState::new(self.config.unwrap_or_default())
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_builder_defaults() {
        let state = AppStateBuilder::new().build();
        assert_eq!(state.config().service.admin_addr, "127.0.0.1:9090");
        assert_eq!(state.active_connection_count(), 0);
    }

    #[test]
    fn test_admission_control_respects_ceiling() {
        let mut config = Config::default();
        config.service.max_active_connections = 2;
        let state = AppState::new(config);
        assert!(state.try_admit());
        assert!(state.try_admit());
        assert!(!state.try_admit());
        state.release();
        assert!(state.try_admit());
    }

    #[test]
    fn test_health_requires_accepting_and_generation() {
        let state = AppState::new(Config::default());
        assert!(!state.is_healthy());
        state.set_accepting(true);
        assert!(!state.is_healthy());
        state.generations().publish(crate::rules::RuleGeneration::build(1, vec![], vec![]));
        assert!(state.is_healthy());
    }
}
