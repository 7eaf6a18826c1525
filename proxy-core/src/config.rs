//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: `PROXY_`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/egress-proxy/{node_name}/config.toml
//! 4. System directory: /etc/egress-proxy/{node_name}/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Root configuration structure for a proxy node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub control_plane: ControlPlaneConfig,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub waf: WafConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub blocklist: BlocklistConfig,
}

/// Process-level configuration: listeners, worker pool, shutdown behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Hostname override reported at registration (defaults to OS hostname).
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data-plane TCP listen address.
    #[serde(default = "default_data_plane_addr")]
    pub data_plane_addr: String,

    /// Data-plane UDP listen address (opaque forwarding only).
    #[serde(default)]
    pub data_plane_udp_addr: Option<String>,

    /// Admin/scrape listen address (`/healthz`, `/metrics`).
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    /// Worker pool size; 0 means auto-size from available parallelism.
    #[serde(default)]
    pub worker_pool_size: usize,

    /// Ceiling on concurrently active workers before admission control rejects
    /// new connections outright once the ceiling is reached.
    #[serde(default = "default_max_active_connections")]
    pub max_active_connections: usize,

    /// Per-flow connection timeout budget in seconds.
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Idle timeout for an established flow before FORWARDING is torn down.
    #[serde(default = "default_flow_idle_timeout_secs")]
    pub flow_idle_timeout_secs: u64,

    /// Bounded drain window for graceful shutdown (default 30s).
    #[serde(default = "default_drain_window_secs")]
    pub drain_window_secs: u64,
}

impl ServiceConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn flow_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_idle_timeout_secs)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.drain_window_secs)
    }

    /// Resolve `0` (auto) to the number of available CPUs.
    pub fn effective_worker_pool_size(&self) -> usize {
        if self.worker_pool_size == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_pool_size
        }
    }
}

/// Control-plane RPC client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub url: String,
    pub cluster_api_key: String,

    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_sync_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Rejects a synced rule set outright if it names more rules than this
    /// — the previous generation
    /// stays live.
    #[serde(default = "default_max_rules")]
    pub max_rules: usize,
}

impl ControlPlaneConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Exponential backoff is capped at one poll interval.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs.min(self.sync_interval_secs))
    }
}

/// Process-wide TLS material paths for server-side termination and optional mTLS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,

    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_global_rps")]
    pub global_rps: u32,

    #[serde(default = "default_global_burst")]
    pub global_burst: u32,

    #[serde(default = "default_identity_rps")]
    pub per_identity_rps: u32,

    #[serde(default = "default_identity_burst")]
    pub per_identity_burst: u32,

    /// Endpoints requiring a dedicated `(identity, path)` bucket.
    #[serde(default)]
    pub expensive_endpoints: Vec<EndpointRateLimit>,

    #[serde(default = "default_quota_per_hour")]
    pub quota_per_hour: u64,

    #[serde(default = "default_quota_per_day")]
    pub quota_per_day: u64,

    #[serde(default = "default_block_threshold")]
    pub block_threshold: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default)]
    pub whitelist: Vec<String>,

    /// DDoS detector configuration.
    #[serde(default)]
    pub ddos: DdosConfig,

    #[serde(default = "default_bucket_idle_secs")]
    pub bucket_idle_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_rps: default_global_rps(),
            global_burst: default_global_burst(),
            per_identity_rps: default_identity_rps(),
            per_identity_burst: default_identity_burst(),
            expensive_endpoints: Vec::new(),
            quota_per_hour: default_quota_per_hour(),
            quota_per_day: default_quota_per_day(),
            block_threshold: default_block_threshold(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_cap_ms: default_backoff_cap_ms(),
            whitelist: Vec::new(),
            ddos: DdosConfig::default(),
            bucket_idle_secs: default_bucket_idle_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRateLimit {
    pub path: String,
    pub rps: u32,
    pub burst: u32,
}

/// DDoS detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ddos_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_ddos_rate_threshold")]
    pub rate_threshold: u32,

    #[serde(default = "default_ddos_distinct_endpoints_cap")]
    pub distinct_endpoints_cap: u32,

    #[serde(default = "default_ddos_distinct_user_agents_cap")]
    pub distinct_user_agents_cap: u32,

    /// Multiple of `rate_threshold` above which a source is mitigated for
    /// `severe_block_secs` instead of `moderate_block_secs`.
    #[serde(default = "default_ddos_severe_multiplier")]
    pub severe_multiplier: f64,

    /// Block duration for a source observed above `rate_threshold` but
    /// below `severe_multiplier * rate_threshold`.
    #[serde(default = "default_ddos_moderate_block_secs")]
    pub moderate_block_secs: u64,

    /// Block duration for a source observed at or above
    /// `severe_multiplier * rate_threshold`.
    #[serde(default = "default_ddos_severe_block_secs")]
    pub severe_block_secs: u64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_ddos_window_secs(),
            rate_threshold: default_ddos_rate_threshold(),
            distinct_endpoints_cap: default_ddos_distinct_endpoints_cap(),
            distinct_user_agents_cap: default_ddos_distinct_user_agents_cap(),
            severe_multiplier: default_ddos_severe_multiplier(),
            moderate_block_secs: default_ddos_moderate_block_secs(),
            severe_block_secs: default_ddos_severe_block_secs(),
        }
    }
}

/// WAF configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafConfig {
    #[serde(default = "default_waf_mode")]
    pub mode: String,

    #[serde(default = "default_waf_threshold")]
    pub blocking_threshold: u32,

    #[serde(default = "default_true")]
    pub rule_engine_enabled: bool,

    #[serde(default = "default_true")]
    pub anomaly_detector_enabled: bool,

    #[serde(default = "default_false")]
    pub geo_blocker_enabled: bool,

    #[serde(default)]
    pub geo_allow_list: Vec<String>,

    #[serde(default)]
    pub geo_block_list: Vec<String>,

    #[serde(default = "default_false")]
    pub reputation_enabled: bool,

    #[serde(default = "default_reputation_ttl_secs")]
    pub reputation_ttl_secs: u64,

    /// Sliding window over which the anomaly detector tracks per-identity
    /// request timestamps.
    #[serde(default = "default_anomaly_window_secs")]
    pub anomaly_window_secs: u64,

    /// Multiple of an identity's own baseline rate that counts as a burst.
    #[serde(default = "default_anomaly_spike_multiplier")]
    pub anomaly_spike_multiplier: f64,

    /// Upper bound on the score contributed by the anomaly detector alone.
    #[serde(default = "default_anomaly_max_score")]
    pub anomaly_max_score: u32,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            mode: default_waf_mode(),
            blocking_threshold: default_waf_threshold(),
            rule_engine_enabled: true,
            anomaly_detector_enabled: true,
            geo_blocker_enabled: false,
            geo_allow_list: Vec::new(),
            geo_block_list: Vec::new(),
            reputation_enabled: false,
            reputation_ttl_secs: default_reputation_ttl_secs(),
            anomaly_window_secs: default_anomaly_window_secs(),
            anomaly_spike_multiplier: default_anomaly_spike_multiplier(),
            anomaly_max_score: default_anomaly_max_score(),
        }
    }
}

impl WafConfig {
    pub fn reputation_ttl(&self) -> Duration {
        Duration::from_secs(self.reputation_ttl_secs)
    }

    pub fn anomaly_window(&self) -> Duration {
        Duration::from_secs(self.anomaly_window_secs)
    }
}

/// Compression engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_compression_min_bytes")]
    pub min_bytes: usize,

    #[serde(default = "default_compression_max_bytes")]
    pub max_bytes: usize,

    #[serde(default = "default_content_type_includes")]
    pub content_type_includes: Vec<String>,

    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    #[serde(default = "default_enabled_algorithms")]
    pub enabled_algorithms: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_bytes: default_compression_min_bytes(),
            max_bytes: default_compression_max_bytes(),
            content_type_includes: default_content_type_includes(),
            quality_threshold: default_quality_threshold(),
            enabled_algorithms: default_enabled_algorithms(),
        }
    }
}

/// Blocklist configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_block_duration_secs")]
    pub default_block_duration_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_block_duration_secs: default_block_duration_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl BlocklistConfig {
    pub fn default_block_duration(&self) -> Duration {
        Duration::from_secs(self.default_block_duration_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// --- default value functions -------------------------------------------------

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_plane_addr() -> String {
    "0.0.0.0:9000".to_string()
}
fn default_admin_addr() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_max_active_connections() -> usize {
    10_000
}
fn default_connection_timeout_secs() -> u64 {
    10
}
fn default_flow_idle_timeout_secs() -> u64 {
    300
}
fn default_drain_window_secs() -> u64 {
    30
}
fn default_sync_interval_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_sync_max_backoff_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_global_rps() -> u32 {
    5_000
}
fn default_global_burst() -> u32 {
    1_000
}
fn default_identity_rps() -> u32 {
    10
}
fn default_identity_burst() -> u32 {
    10
}
fn default_quota_per_hour() -> u64 {
    100_000
}
fn default_quota_per_day() -> u64 {
    1_000_000
}
fn default_block_threshold() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_cap_ms() -> u64 {
    3_600_000
}
fn default_bucket_idle_secs() -> u64 {
    600
}
fn default_ddos_window_secs() -> u64 {
    10
}
fn default_ddos_rate_threshold() -> u32 {
    100
}
fn default_ddos_distinct_endpoints_cap() -> u32 {
    100
}
fn default_ddos_distinct_user_agents_cap() -> u32 {
    10
}
fn default_ddos_severe_multiplier() -> f64 {
    5.0
}
fn default_ddos_moderate_block_secs() -> u64 {
    3_600
}
fn default_ddos_severe_block_secs() -> u64 {
    86_400
}
fn default_anomaly_window_secs() -> u64 {
    60
}
fn default_anomaly_spike_multiplier() -> f64 {
    3.0
}
fn default_anomaly_max_score() -> u32 {
    40
}
fn default_max_rules() -> usize {
    50_000
}
fn default_waf_mode() -> String {
    "prevention".to_string()
}
fn default_waf_threshold() -> u32 {
    50
}
fn default_reputation_ttl_secs() -> u64 {
    300
}
fn default_compression_min_bytes() -> usize {
    256
}
fn default_compression_max_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_content_type_includes() -> Vec<String> {
    vec![
        "text/*".to_string(),
        "application/json".to_string(),
        "application/javascript".to_string(),
        "application/xml".to_string(),
    ]
}
fn default_quality_threshold() -> f64 {
    0.9
}
fn default_enabled_algorithms() -> Vec<String> {
    vec!["gzip".to_string(), "br".to_string(), "deflate".to_string()]
}
fn default_block_duration_secs() -> u64 {
    3600
}
fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from all sources, inferring the node name from the
    /// running binary (falls back to `"egress-proxy"`).
    pub fn load() -> Result<Self> {
        let node_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "egress-proxy".to_string());

        Self::load_for_node(&node_name)
    }

    /// Load configuration for a specific node name.
    pub fn load_for_node(node_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(node_name);

        tracing::debug!("searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("PROXY_").split("_"));

        Ok(figment.extract()?)
    }

    /// Load configuration directly from a path, bypassing XDG search.
    /// Used by tests and container deployments with a fixed config mount.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PROXY_").split("_"))
            .extract()?;

        Ok(config)
    }

    fn find_config_paths(node_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("egress-proxy");
        let config_file_path = Path::new(node_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/egress-proxy").join(node_name).join("config.toml"));

        paths
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                hostname: None,
                log_level: default_log_level(),
                data_plane_addr: default_data_plane_addr(),
                data_plane_udp_addr: None,
                admin_addr: default_admin_addr(),
                worker_pool_size: 0,
                max_active_connections: default_max_active_connections(),
                connection_timeout_secs: default_connection_timeout_secs(),
                flow_idle_timeout_secs: default_flow_idle_timeout_secs(),
                drain_window_secs: default_drain_window_secs(),
            },
            control_plane: ControlPlaneConfig {
                url: "https://control-plane.internal".to_string(),
                cluster_api_key: String::new(),
                sync_interval_secs: default_sync_interval_secs(),
                heartbeat_interval_secs: default_heartbeat_interval_secs(),
                max_backoff_secs: default_sync_max_backoff_secs(),
                max_rules: default_max_rules(),
            },
            tls: None,
            rate_limit: RateLimitConfig::default(),
            waf: WafConfig::default(),
            compression: CompressionConfig::default(),
            blocklist: BlocklistConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.admin_addr, "127.0.0.1:9090");
        assert_eq!(config.rate_limit.per_identity_rps, 10);
        assert_eq!(config.waf.mode, "prevention");
    }

    #[test]
    fn test_worker_pool_auto_sizes() {
        let mut config = Config::default();
        config.service.worker_pool_size = 0;
        assert!(config.service.effective_worker_pool_size() > 0);
        config.service.worker_pool_size = 7;
        assert_eq!(config.service.effective_worker_pool_size(), 7);
    }

    #[test]
    fn test_backoff_capped_at_sync_interval() {
        let mut cp = Config::default().control_plane;
        cp.sync_interval_secs = 30;
        cp.max_backoff_secs = 120;
        assert_eq!(cp.max_backoff().as_secs(), 30);
    }
}
