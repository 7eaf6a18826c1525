//! # proxy-core
//!
//! Egress policy proxy data-plane engine: control-plane rule synchronization,
//! a fast-path O(1) classifier, a slow-path per-flow state machine (auth,
//! TLS termination, WebSocket upgrade, destination dialing, bidirectional
//! forwarding), and an ingress defence layer (WAF, tiered rate limiting,
//! blocklist, optional compression).
//!
//! ## Example
//!
//! ```rust,no_run
//! use proxy_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::builder().config(config.clone()).build();
//!
//!     let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!     tokio::try_join!(
//!         accept::run(state.clone(), shutdown_rx.clone()),
//!         admin::run(state, shutdown_rx),
//!     )?;
//!
//!     Ok(())
//! }
//! ```

pub mod accept;
pub mod admin;
pub mod blocklist;
pub mod classifier;
pub mod compression;
pub mod config;
pub mod controlplane;
pub mod counters;
pub mod error;
pub mod flow;
pub mod ids;
pub mod middleware;
pub mod observability;
pub mod ratelimit;
pub mod rules;
pub mod slowpath;
pub mod state;
pub mod waf;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::accept;
    pub use crate::admin;
    pub use crate::blocklist::{Blocklist, BlocklistEntry};
    pub use crate::classifier::{classify, Verdict};
    pub use crate::compression::{Algorithm, CompressionEngine};
    pub use crate::config::{Config, RateLimitConfig, WafConfig};
    pub use crate::controlplane::{ControlPlaneClient, HttpControlPlaneClient};
    pub use crate::counters::{names as counter_names, Counters};
    pub use crate::error::{Error, FlowError, Result};
    pub use crate::flow::{Flow, FiveTuple, FlowState};
    pub use crate::ids::{EventId, FlowId, RuleId};
    pub use crate::observability::init_tracing;
    pub use crate::ratelimit::RateLimiter;
    pub use crate::rules::{GenerationStore, Rule, RuleGeneration, Synchronizer};
    pub use crate::slowpath;
    pub use crate::state::{AppState, AppStateBuilder};
    pub use crate::waf::Waf;

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{get, post},
        Router,
    };

    pub use serde::{Deserialize, Serialize};
    pub use tracing::{debug, error, info, instrument, trace, warn};
    pub use tokio;
    pub use async_trait::async_trait;
    pub use thiserror::Error;
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}
