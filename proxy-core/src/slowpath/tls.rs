//! TLS termination for slow-path rules
//!
//! Rules with `tls: true` are terminated against a process-wide cert/key
//! pair loaded from `Config.tls`, resolved at handshake time through
//! rustls's `ResolvesServerCert` so the same machinery extends to per-SNI
//! certificates later without changing the accept-loop call site.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::error::{Error, FlowError};

/// Resolves a `CertifiedKey` by exact SNI match, falling back to a default
/// cert when the client sent no SNI or an unregistered name.
#[derive(Debug)]
pub struct SniResolver {
    certs: HashMap<String, Arc<CertifiedKey>>,
    default: Option<Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new(certs: HashMap<String, Arc<CertifiedKey>>, default: Option<Arc<CertifiedKey>>) -> Self {
        Self { certs, default }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            if let Some(cert) = self.certs.get(name) {
                return Some(cert.clone());
            }
        }
        self.default.clone()
    }
}

pub fn build_server_config(resolver: Arc<SniResolver>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder().with_no_client_auth().with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Load a PEM cert chain + private key off disk into a `CertifiedKey`.
fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, Error> {
    let cert_file = File::open(cert_path).map_err(Error::Io)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<_>>()
        .map_err(Error::Io)?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", cert_path.display())));
    }

    let key_file = File::open(key_path).map_err(Error::Io)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(Error::Io)?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", key_path.display())))?;

    let signing_key = any_supported_type(&key).map_err(|e| Error::Tls(e.to_string()))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Build the process-wide `ServerConfig` for `tls: true` rules from
/// `Config.tls`. There is one cert/key pair today; `SniResolver` still
/// mediates handshakes so a future per-rule certificate map only needs to
/// populate the resolver's map, not change any call site.
pub fn build_default_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>, Error> {
    let key = Arc::new(load_certified_key(&config.cert_path, &config.key_path)?);
    let resolver = Arc::new(SniResolver::new(HashMap::new(), Some(key)));
    Ok(build_server_config(resolver))
}

/// Parse a PEM cert chain + private key delivered inline (control-plane
/// `certificates[]`, as opposed to the on-disk pair in `Config.tls`).
fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, Error> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::io::Result<_>>()
        .map_err(Error::Io)?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificates found in inline certificate PEM".into()));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(Error::Io)?
        .ok_or_else(|| Error::Tls("no private key found in inline certificate PEM".into()))?;
    let signing_key = any_supported_type(&key).map_err(|e| Error::Tls(e.to_string()))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Build a per-SNI `ServerConfig` from control-plane-delivered certificates,
/// falling back to `default` (typically the static `Config.tls` pair) when a
/// handshake's SNI matches none of them.
pub fn build_server_config_from_certificates(
    certificates: &[crate::controlplane::Certificate],
    default: Option<Arc<CertifiedKey>>,
) -> Result<Arc<ServerConfig>, Error> {
    let mut certs = HashMap::with_capacity(certificates.len());
    for cert in certificates {
        let key = certified_key_from_pem(&cert.cert_pem, &cert.key_pem)?;
        certs.insert(cert.sni.clone(), Arc::new(key));
    }
    let resolver = Arc::new(SniResolver::new(certs, default));
    Ok(build_server_config(resolver))
}

/// Perform the TLS handshake over an already-accepted TCP stream, returning
/// the established `TlsStream` or a `FlowError::TlsHandshakeFailed`.
pub async fn terminate(stream: TcpStream, server_config: Arc<ServerConfig>) -> Result<TlsStream<TcpStream>, FlowError> {
    let acceptor = TlsAcceptor::from(server_config);
    acceptor
        .accept(stream)
        .await
        .map_err(|e| FlowError::TlsHandshakeFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_falls_back_to_default_when_no_match() {
        // Constructing a real CertifiedKey needs a signing key; this test
        // only exercises the fallback-selection logic shape, not a live
        // handshake (covered by the slow-path processor's integration
        // tests with a real cert pair).
        let resolver = SniResolver::new(HashMap::new(), None);
        assert!(resolver.certs.is_empty());
        assert!(resolver.default.is_none());
    }
}
