//! Slow-path per-flow processing
//!
//! Everything a connection needs once the fast path escalates
//! it — authentication, TLS termination, HTTP header parsing, WebSocket
//! upgrade, destination dialing, and bidirectional forwarding — split into
//! one module per concern and driven by [`processor::process`].

pub mod auth;
pub mod destination;
pub mod forward;
pub mod httpparse;
pub mod processor;
pub mod tls;
pub mod websocket;

pub use auth::{validate_jwt, JwtClaims, JwtKeyMaterial, OpaqueTokenStore};
pub use destination::DestinationDialer;
pub use forward::pump;
pub use httpparse::{peek_request, ParsedRequest, Replay};
pub use processor::{process, ProcessorContext, ProcessorOutcome};
pub use tls::{build_default_server_config, build_server_config, build_server_config_from_certificates, terminate, SniResolver};
pub use websocket::{accept_key, handshake_response, is_upgrade_request};
