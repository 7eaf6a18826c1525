//! Control-plane client: fetching rule configuration and reporting status
//!
//! `ControlPlaneClient` is a trait seam so the synchronizer can be tested
//! against an in-memory fake instead of a real HTTP control plane, built on
//! an async trait behind `AppState` with an HTTP-backed impl on `reqwest`.
//!
//! The control plane speaks services and mappings, not rules: a `Service`
//! describes one addressable backend (host, port, protocol, auth, TLS), and
//! a `Mapping` describes which source services may reach which destination
//! services, over which protocols/ports, and under what auth/routing
//! requirements. [`build_rules`] joins the two into the `Rule`s the
//! synchronizer classifies into fast/slow tables.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::RuleId;
use crate::rules::model::{AuthMode, Destination, PortSelector, Protocol, Rule, RuleAction, SourceMatch};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigurationRequest {
    pub last_version: Option<u64>,
}

/// One addressable backend the proxy may dial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: PortSelector,
    pub protocol: Protocol,
    pub auth_type: AuthMode,
    pub auth_config: Option<serde_json::Value>,
    pub tls_enabled: bool,
}

/// A routing exception within a mapping: requests whose `header` starts
/// with `value_prefix` are sent to `dest_service_id` instead of the
/// mapping's default destination set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub header: String,
    pub value_prefix: String,
    pub dest_service_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    RoundRobin,
    Random,
    LeastConnections,
}

/// Which source services may reach which destination services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: String,
    pub source_service_ids: Vec<String>,
    pub dest_service_ids: Vec<String>,
    pub protocols: Vec<Protocol>,
    pub ports: Vec<u16>,
    pub auth_required: bool,
    pub supports_websocket: bool,
    pub load_balancing: LoadBalancing,
    pub routing_rules: Vec<RoutingRule>,
}

/// An inline PEM cert/key pair for a given SNI, delivered by the control
/// plane instead of read off disk (`Config.tls`'s static pair).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub sni: String,
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOverride {
    pub target_id: String,
    pub rps: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConfigurationResponse {
    pub version: u64,
    /// `None` on all four of these fields together means the control plane
    /// reports no change since `last_version`.
    pub services: Option<Vec<Service>>,
    pub mappings: Option<Vec<Mapping>>,
    pub certificates: Option<Vec<Certificate>>,
    pub rate_limit_overrides: Option<Vec<RateLimitOverride>>,
}

/// Join services and mappings into the `Rule`s the synchronizer classifies.
/// One `Rule` per `(mapping, protocol, source)` triple: `load_balancing`
/// maps to the destination dialer's existing round-robin behavior over
/// `Rule.destinations`, so every dest service in a mapping becomes one
/// destination on the same rule rather than a separate rule. A mapping
/// naming no source services is a wildcard-source rule. `supports_websocket`
/// and any `routing_rules` both force the mapping onto the slow path by
/// setting `header_routing`, since neither can be served by the fast-path
/// byte pump.
pub fn build_rules(services: &[Service], mappings: &[Mapping]) -> Vec<Rule> {
    let by_id: HashMap<&str, &Service> = services.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut rules = Vec::new();

    for mapping in mappings {
        let dest_services: Vec<&Service> =
            mapping.dest_service_ids.iter().filter_map(|id| by_id.get(id.as_str()).copied()).collect();
        if dest_services.is_empty() {
            continue;
        }
        let destinations: Vec<Destination> = dest_services
            .iter()
            .map(|svc| Destination { host: svc.host.clone(), port: svc.port.expand().first().copied().unwrap_or(0) })
            .collect();

        let ports = if !mapping.ports.is_empty() {
            PortSelector::List(mapping.ports.clone())
        } else {
            dest_services[0].port.clone()
        };

        let tls = dest_services.iter().any(|svc| svc.tls_enabled);
        let auth = if mapping.auth_required {
            dest_services.iter().map(|svc| svc.auth_type).find(|a| *a != AuthMode::None).unwrap_or(AuthMode::None)
        } else {
            AuthMode::None
        };
        let header_routing = mapping.supports_websocket || !mapping.routing_rules.is_empty();

        let sources: Vec<Option<String>> = if mapping.source_service_ids.is_empty() {
            vec![None]
        } else {
            mapping
                .source_service_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .map(|svc| Some(svc.host.clone()))
                .collect()
        };

        for protocol in &mapping.protocols {
            for source_host in &sources {
                rules.push(Rule {
                    id: RuleId::new(),
                    source: SourceMatch { cidr: source_host.clone() },
                    destinations: destinations.clone(),
                    ports: ports.clone(),
                    protocol: *protocol,
                    auth,
                    tls,
                    header_routing,
                    action: RuleAction::Allow,
                    priority: 0,
                });
            }
        }
    }

    rules
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub current_version: u64,
    pub active_flows: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
}

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn get_configuration(&self, req: GetConfigurationRequest) -> Result<GetConfigurationResponse>;
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse>;
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse>;
}

/// `reqwest`-backed control-plane client, used in production.
pub struct HttpControlPlaneClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpControlPlaneClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn get_configuration(&self, req: GetConfigurationRequest) -> Result<GetConfigurationResponse> {
        let url = format!("{}/v1/configuration", self.base_url);
        let resp = self
            .client
            .get(url)
            .query(&[("last_version", req.last_version)])
            .send()
            .await
            .map_err(|e| crate::error::Error::ControlPlane(e.to_string()))?;
        resp.json().await.map_err(|e| crate::error::Error::ControlPlane(e.to_string()))
    }

    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        let url = format!("{}/v1/register", self.base_url);
        let resp = self
            .client
            .post(url)
            .json(&req)
            .send()
            .await
            .map_err(|e| crate::error::Error::ControlPlane(e.to_string()))?;
        resp.json().await.map_err(|e| crate::error::Error::ControlPlane(e.to_string()))
    }

    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let url = format!("{}/v1/heartbeat", self.base_url);
        let resp = self
            .client
            .post(url)
            .json(&req)
            .send()
            .await
            .map_err(|e| crate::error::Error::ControlPlane(e.to_string()))?;
        resp.json().await.map_err(|e| crate::error::Error::ControlPlane(e.to_string()))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// In-memory fake for synchronizer tests. Returns a fixed script of
    /// responses in order, then repeats the last one.
    pub struct FakeControlPlaneClient {
        responses: Mutex<Vec<GetConfigurationResponse>>,
        pub fail_next: Mutex<bool>,
    }

    impl FakeControlPlaneClient {
        pub fn new(responses: Vec<GetConfigurationResponse>) -> Self {
            Self { responses: Mutex::new(responses), fail_next: Mutex::new(false) }
        }
    }

    #[async_trait]
    impl ControlPlaneClient for FakeControlPlaneClient {
        async fn get_configuration(&self, _req: GetConfigurationRequest) -> Result<GetConfigurationResponse> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err(crate::error::Error::ControlPlane("simulated failure".into()));
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                Ok(responses.first().cloned().unwrap_or(GetConfigurationResponse {
                    version: 0,
                    services: None,
                    mappings: None,
                    certificates: None,
                    rate_limit_overrides: None,
                }))
            }
        }

        async fn register(&self, _req: RegisterRequest) -> Result<RegisterResponse> {
            Ok(RegisterResponse { accepted: true })
        }

        async fn heartbeat(&self, _req: HeartbeatRequest) -> Result<HeartbeatResponse> {
            Ok(HeartbeatResponse { acknowledged: true })
        }
    }
}
