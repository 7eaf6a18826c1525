//! Bidirectional forwarding
//!
//! The FORWARDING state pumps bytes both directions between the
//! client and the chosen upstream until either side closes, an idle
//! timeout elapses, or one direction errors — in which case the other
//! direction is half-closed rather than torn down immediately, so a
//! client that's still reading a response isn't cut off mid-stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::FlowError;
use crate::flow::FlowCounters;

/// Copy bytes both directions until EOF, error, or idle timeout. Returns
/// updated byte/packet counters for the flow.
pub async fn pump<A, B>(client: A, upstream: B, idle_timeout: Duration) -> Result<FlowCounters, FlowError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let result = tokio::io::copy(&mut client_r, &mut upstream_w).await;
        let _ = upstream_w.shutdown().await;
        result
    };
    let upstream_to_client = async {
        let result = tokio::io::copy(&mut upstream_r, &mut client_w).await;
        let _ = client_w.shutdown().await;
        result
    };

    let pumped = timeout(idle_timeout, futures::future::join(client_to_upstream, upstream_to_client)).await;

    match pumped {
        Ok((c2u, u2c)) => {
            let bytes_out = c2u.map_err(|e| FlowError::UpstreamIoFailed(e.to_string()))?;
            let bytes_in = u2c.map_err(|e| FlowError::UpstreamIoFailed(e.to_string()))?;
            Ok(FlowCounters { bytes_in, bytes_out, packets_in: 0, packets_out: 0 })
        }
        Err(_) => Err(FlowError::UpstreamIoFailed("idle timeout exceeded".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt as _};

    #[tokio::test]
    async fn test_pump_copies_bytes_until_eof() {
        let (mut client_a, client_b) = duplex(64);
        let (upstream_a, mut upstream_b) = duplex(64);

        client_a.write_all(b"hello").await.unwrap();
        drop(client_a);
        upstream_b.write_all(b"world").await.unwrap();
        drop(upstream_b);

        let counters = pump(client_b, upstream_a, Duration::from_secs(5)).await.unwrap();
        assert_eq!(counters.bytes_out, 5);
        assert_eq!(counters.bytes_in, 5);
    }
}
