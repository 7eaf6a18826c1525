//! WebSocket upgrade detection and handshake
//!
//! The WS_UPGRADE side path is reached from HTTP_PARSE when the
//! request carries `Upgrade: websocket` + `Connection: Upgrade`, responds
//! with the 101 handshake, then rejoins FORWARDING as a framing-agnostic
//! byte pump — this module does not parse WebSocket frames, since the
//! proxy forwards the connection rather than terminating the protocol.

use base64::Engine;
use sha1::{Digest, Sha1};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub fn is_upgrade_request(headers: &http::HeaderMap) -> bool {
    let has_upgrade_header = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let has_connection_upgrade = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_header && has_connection_upgrade
}

/// Compute the `Sec-WebSocket-Accept` value for a client's
/// `Sec-WebSocket-Key`, per RFC 6455 §4.2.2.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Build the 101 response headers for a successful upgrade.
pub fn handshake_response(client_key: &str) -> Vec<(&'static str, String)> {
    vec![
        ("Upgrade", "websocket".to_string()),
        ("Connection", "Upgrade".to_string()),
        ("Sec-WebSocket-Accept", accept_key(client_key)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_upgrade_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::UPGRADE, "websocket".parse().unwrap());
        headers.insert(http::header::CONNECTION, "Upgrade".parse().unwrap());
        assert!(is_upgrade_request(&headers));
    }

    #[test]
    fn test_missing_connection_header_is_not_an_upgrade() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::UPGRADE, "websocket".parse().unwrap());
        assert!(!is_upgrade_request(&headers));
    }

    #[test]
    fn test_accept_key_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
