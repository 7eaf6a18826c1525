//! Data-plane accept loop
//!
//! Binds the TCP (and, when configured, UDP) data-plane listeners, applies
//! admission control before spawning a worker per connection, and routes
//! each connection through the fast-path classifier first, falling through
//! to the slow-path processor on `Verdict::Escalate`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::classifier::{self, Verdict};
use crate::compression::{Algorithm, CompressionEngine};
use crate::counters::names;
use crate::error::{Error, FlowError};
use crate::flow::{FiveTuple, Flow};
use crate::rules::model::{Destination, Protocol};
use crate::slowpath::forward::pump;
use crate::slowpath::httpparse::{self, ParsedRequest, Replay};
use crate::slowpath::processor::{self, ProcessorContext};
use crate::slowpath::{destination::DestinationDialer, tls, websocket};
use crate::state::AppState;

/// Bound on the HTTP request line + headers peeked off a slow-path
/// connection before giving up and treating it as a non-HTTP flow.
const MAX_PEEK_BYTES: usize = 16 * 1024;

/// Runs the accept loop until `shutdown` resolves, honoring the configured
/// worker pool size as a concurrency cap rather than a fixed thread pool —
/// each accepted connection is a tokio task, and the cap bounds how many
/// may run at once via a semaphore.
pub async fn run(state: AppState, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), Error> {
    let listener = TcpListener::bind(&state.config().service.data_plane_addr)
        .await
        .map_err(Error::Io)?;
    tracing::info!(addr = %state.config().service.data_plane_addr, "data-plane TCP listener bound");

    if let Some(udp_addr) = state.config().service.data_plane_udp_addr.clone() {
        let udp_state = state.clone();
        let udp_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_udp(udp_state, udp_addr, udp_shutdown).await {
                tracing::error!(error = %e, "UDP data-plane listener exited");
            }
        });
    }

    let pool_size = state.config().service.effective_worker_pool_size();
    let semaphore = Arc::new(tokio::sync::Semaphore::new(pool_size));
    state.set_accepting(true);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("accept loop shutting down");
                    state.set_accepting(false);
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                if !state.try_admit() {
                    state.counters().inc(names::DENIED_TOTAL, &[("reason", "admission_ceiling")]);
                    continue;
                }

                let permit = semaphore.clone().acquire_owned().await.ok();
                let state = state.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_connection(state.clone(), stream, peer).await;
                    state.release();
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(state: AppState, client: TcpStream, peer: SocketAddr) {
    let dst_port = match client.local_addr() {
        Ok(addr) => addr.port(),
        Err(_) => return,
    };

    let generation = state.generations().current();
    let verdict = classifier::classify(&generation, peer.ip(), dst_port, Protocol::Tcp);

    match verdict {
        Verdict::Drop(reason) => {
            state.counters().inc(names::DENIED_TOTAL, &[("reason", reason)]);
        }
        Verdict::Allow(destination) => {
            state.counters().inc(names::UPSTREAM_REQUESTS_TOTAL, &[("path", "fast")]);
            let dialer = DestinationDialer::new(vec![destination]);
            match dialer.connect().await {
                Ok((upstream, _)) => {
                    let idle_timeout = state.config().service.flow_idle_timeout();
                    if let Err(e) = pump(client, upstream, idle_timeout).await {
                        state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "fast")]);
                        tracing::debug!(error = %e, "fast-path forwarding ended with error");
                    }
                }
                Err(e) => {
                    state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "fast")]);
                    tracing::debug!(error = %e, "fast-path upstream connect failed");
                }
            }
        }
        Verdict::Escalate => {
            handle_slow_path(state, client, peer, dst_port).await;
        }
    }
}

async fn handle_slow_path(state: AppState, client: TcpStream, peer: SocketAddr, dst_port: u16) {
    let generation = state.generations().current();
    let Some(rule) = generation.slow_lookup(peer.ip(), dst_port, Protocol::Tcp) else {
        state.counters().inc(names::DENIED_TOTAL, &[("reason", "no_rule")]);
        return;
    };
    let rule = rule.clone();

    let ctx = ProcessorContext {
        rule: rule.clone(),
        waf: state.waf().clone(),
        rate_limiter: state.rate_limiter().clone(),
        blocklist: state.blocklist().clone(),
        counters: state.counters().clone(),
        jwt_key: None,
        opaque_tokens: None,
    };

    let flow = Flow::new(FiveTuple {
        src_ip: peer.ip(),
        src_port: peer.port(),
        dst_ip: peer.ip(),
        dst_port,
    });

    if rule.tls {
        let Some(server_config) = state.tls_server_config() else {
            state.counters().inc(names::DENIED_TOTAL, &[("reason", "tls_unconfigured")]);
            tracing::warn!("rule requires TLS but no TLS material is configured");
            return;
        };
        match tls::terminate(client, server_config).await {
            Ok(tls_stream) => drive_flow(tls_stream, state, ctx, flow, peer.ip()).await,
            Err(e) => {
                state.counters().inc(names::DENIED_TOTAL, &[("reason", "tls_handshake_failed")]);
                tracing::debug!(error = %e, "TLS handshake failed on slow path");
            }
        }
    } else {
        drive_flow(client, state, ctx, flow, peer.ip()).await;
    }
}

/// Peek the request, run it through the processor, and either write a
/// protocol-appropriate rejection response or forward it upstream —
/// generic over the underlying stream so the same path serves both plain
/// TCP and a just-terminated TLS stream.
async fn drive_flow<S>(mut stream: S, state: AppState, ctx: ProcessorContext, mut flow: Flow, client_addr: IpAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let read_timeout = state.config().service.connection_timeout();
    let (raw_prefix, parsed) = httpparse::peek_request(&mut stream, read_timeout, MAX_PEEK_BYTES).await;
    let is_ws_upgrade = parsed.as_ref().map(ParsedRequest::is_websocket_upgrade).unwrap_or(false);
    let ws_key = parsed.as_ref().and_then(|r| r.header("sec-websocket-key").map(str::to_string));

    match processor::process(&mut flow, &ctx, client_addr, parsed.as_ref(), &raw_prefix).await {
        processor::ProcessorOutcome::Rejected(e) => {
            state.counters().inc(names::DENIED_TOTAL, &[("reason", "slow_path_rejected")]);
            tracing::debug!(error = %e, flow_id = %flow.id, "slow-path flow rejected");
            if parsed.is_some() {
                let accept_encoding = parsed.as_ref().and_then(|r| r.header("accept-encoding")).unwrap_or("");
                write_rejection_response(&mut stream, &e, state.compression(), accept_encoding).await;
            }
            // Non-HTTP flows (including a would-be TLS alert) are closed by
            // simply dropping the stream; there's no well-formed response to
            // send on a connection whose framing was never established.
        }
        processor::ProcessorOutcome::ReadyToForward { dialer } => {
            state.counters().inc(names::UPSTREAM_REQUESTS_TOTAL, &[("path", "slow")]);
            match dialer.connect().await {
                Ok((upstream, _)) => {
                    if is_ws_upgrade {
                        let Some(key) = ws_key else {
                            state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "slow")]);
                            return;
                        };
                        if write_websocket_handshake(&mut stream, &key).await.is_err() {
                            state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "slow")]);
                            return;
                        }
                    }
                    let idle_timeout = state.config().service.flow_idle_timeout();
                    let replayed = Replay::new(raw_prefix, stream);
                    if let Err(e) = pump(replayed, upstream, idle_timeout).await {
                        state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "slow")]);
                        tracing::debug!(error = %e, flow_id = %flow.id, "slow-path forwarding ended with error");
                    }
                }
                Err(e) => {
                    state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "slow")]);
                    tracing::debug!(error = %e, flow_id = %flow.id, "slow-path upstream connect failed");
                }
            }
        }
    }
}

/// Writes the HTTP status `FlowError::http_status` maps to, with a small
/// JSON body, compressed against the client's `Accept-Encoding` when it
/// qualifies.
async fn write_rejection_response<S>(stream: &mut S, error: &FlowError, compression: &CompressionEngine, accept_encoding: &str)
where
    S: AsyncWrite + Unpin,
{
    let status = error.http_status();
    let body = serde_json::json!({ "error": error.to_string() }).to_string().into_bytes();
    let (body, algo) = compression.compress(&body, "application/json", accept_encoding);

    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
    );
    if let Some(algo) = algo {
        head.push_str(&format!("Content-Encoding: {}\r\n", encoding_token(algo)));
    }
    head.push_str("Connection: close\r\n\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(&body);
    let _ = stream.write_all(&out).await;
    let _ = stream.shutdown().await;
}

fn encoding_token(algo: Algorithm) -> &'static str {
    match algo {
        Algorithm::Gzip => "gzip",
        Algorithm::Brotli => "br",
        Algorithm::Deflate => "deflate",
    }
}

async fn write_websocket_handshake<S>(stream: &mut S, client_key: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = String::from("HTTP/1.1 101 Switching Protocols\r\n");
    for (name, value) in websocket::handshake_response(client_key) {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await
}

/// UDP data plane: opaque, single-datagram request/reply relay. No `Flow`
/// state machine, since UDP is connectionless and forwarded as-is rather
/// than parsed.
async fn run_udp(state: AppState, addr: String, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), Error> {
    let socket = Arc::new(UdpSocket::bind(&addr).await.map_err(Error::Io)?);
    tracing::info!(addr = %addr, "data-plane UDP listener bound");

    let dst_port = addr.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()).unwrap_or(0);
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("UDP accept loop shutting down");
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "udp recv failed");
                        continue;
                    }
                };
                let datagram = buf[..len].to_vec();
                let state = state.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    handle_udp_datagram(state, socket, peer, dst_port, datagram).await;
                });
            }
        }
    }

    Ok(())
}

async fn handle_udp_datagram(state: AppState, socket: Arc<UdpSocket>, peer: SocketAddr, dst_port: u16, datagram: Vec<u8>) {
    if state.blocklist().is_blocked(&peer.ip()) {
        state.counters().inc(names::DENIED_TOTAL, &[("reason", "blocklisted")]);
        return;
    }

    let generation = state.generations().current();
    let destination: Destination = match classifier::classify(&generation, peer.ip(), dst_port, Protocol::Udp) {
        Verdict::Drop(reason) => {
            state.counters().inc(names::DENIED_TOTAL, &[("reason", reason)]);
            return;
        }
        Verdict::Allow(destination) => destination,
        Verdict::Escalate => {
            let Some(rule) = generation.slow_lookup(peer.ip(), dst_port, Protocol::Udp) else {
                state.counters().inc(names::DENIED_TOTAL, &[("reason", "no_rule")]);
                return;
            };
            let identity = peer.ip().to_string();
            if state.rate_limiter().check(peer.ip(), &identity, "udp").is_err() {
                state.counters().inc(names::RATELIMIT_BLOCKED_TOTAL, &[("client_type", "ip"), ("reason", "tier_exceeded")]);
                return;
            }
            let Some(destination) = rule.destinations.first() else {
                state.counters().inc(names::DENIED_TOTAL, &[("reason", "no_destination")]);
                return;
            };
            destination.clone()
        }
    };

    state.counters().inc(names::UPSTREAM_REQUESTS_TOTAL, &[("path", "udp")]);
    let upstream_addr = format!("{}:{}", destination.host, destination.port);

    let relay = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "udp")]);
            tracing::debug!(error = %e, "udp relay socket bind failed");
            return;
        }
    };
    if let Err(e) = relay.connect(&upstream_addr).await {
        state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "udp")]);
        tracing::debug!(error = %e, "udp upstream connect failed");
        return;
    }
    if let Err(e) = relay.send(&datagram).await {
        state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "udp")]);
        tracing::debug!(error = %e, "udp datagram send failed");
        return;
    }

    let mut reply = vec![0u8; 65536];
    match tokio::time::timeout(state.config().service.flow_idle_timeout(), relay.recv(&mut reply)).await {
        Ok(Ok(n)) => {
            let _ = socket.send_to(&reply[..n], peer).await;
        }
        Ok(Err(e)) => {
            state.counters().inc(names::UPSTREAM_ERRORS_TOTAL, &[("path", "udp")]);
            tracing::debug!(error = %e, "udp reply read failed");
        }
        Err(_) => {
            tracing::debug!(peer = %peer, "udp reply timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_admission_control_denies_beyond_ceiling_before_accept_loop_runs() {
        let mut config = Config::default();
        config.service.max_active_connections = 0;
        let state = AppState::new(config);
        assert!(!state.try_admit());
    }

    #[tokio::test]
    async fn test_write_rejection_response_sends_matching_status_and_body() {
        let (mut a, b) = tokio::io::duplex(4096);
        let compression = CompressionEngine::new(crate::config::CompressionConfig { enabled: false, ..crate::config::CompressionConfig::default() });
        let mut stream = b;
        write_rejection_response(&mut stream, &FlowError::AuthFailed("bad token".into()), &compression, "").await;
        drop(stream);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut a, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 401"));
        assert!(text.contains("bad token"));
    }
}
