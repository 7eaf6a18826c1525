//! HTTP/1.1 request-line + header parsing for the slow path
//!
//! In the HTTP_PARSE state, before a flow can be routed by header
//! content, authenticated against a bearer token, or rate-limited by
//! endpoint path, the proxy needs to see the request line and headers —
//! not just the opening bytes of an opaque TCP stream. Grounded on
//! `httparse`, a zero-copy incremental parser, since the proxy only ever
//! needs the request line and header names/values, never a full HTTP
//! implementation (it forwards the body as raw bytes via
//! [`crate::slowpath::forward::pump`] rather than re-serializing it).

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::slowpath::websocket::is_upgrade_request;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl ParsedRequest {
    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        let mut map = http::HeaderMap::new();
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (http::HeaderName::try_from(k.as_str()), http::HeaderValue::from_str(v)) {
                map.insert(name, value);
            }
        }
        is_upgrade_request(&map)
    }
}

enum ParseOutcome {
    Complete(ParsedRequest),
    Partial,
    NotHttp,
}

fn parse(buf: &[u8]) -> ParseOutcome {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {
            let method = req.method.unwrap_or("").to_string();
            let path = req.path.unwrap_or("/").to_string();
            let headers = req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            ParseOutcome::Complete(ParsedRequest { method, path, headers })
        }
        Ok(httparse::Status::Partial) => ParseOutcome::Partial,
        Err(_) => ParseOutcome::NotHttp,
    }
}

/// Read from `stream` until a complete HTTP request line + headers parses,
/// the stream hits EOF, `read_timeout` elapses, or `max_bytes` is exceeded.
/// Returns the raw bytes consumed off the stream alongside the parsed
/// request, if any — a non-HTTP flow (garbage request line, timeout, EOF
/// before completion) returns `None` for the parse but still returns
/// whatever bytes were read, so the caller can replay them to the upstream
/// untouched rather than losing them.
pub async fn peek_request<S>(stream: &mut S, read_timeout: Duration, max_bytes: usize) -> (Vec<u8>, Option<ParsedRequest>)
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let deadline = tokio::time::Instant::now() + read_timeout;

    loop {
        match parse(&buf) {
            ParseOutcome::Complete(req) => return (buf, Some(req)),
            ParseOutcome::NotHttp => return (buf, None),
            ParseOutcome::Partial => {}
        }

        if buf.len() >= max_bytes {
            return (buf, None);
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return (buf, None);
        }

        let mut chunk = [0u8; READ_CHUNK];
        match tokio::time::timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return (buf, None),
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) | Err(_) => return (buf, None),
        }
    }
}

/// Wraps a stream whose leading bytes were already consumed by
/// [`peek_request`], replaying them to readers before falling through to
/// the live stream. Writes pass straight through. Needed because
/// [`crate::slowpath::forward::pump`] reads the client side with a plain
/// `tokio::io::copy` that has no way to "un-read" bytes already taken off
/// the socket during header inspection.
pub struct Replay<S> {
    buf: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Replay<S> {
    pub fn new(buf: Vec<u8>, inner: S) -> Self {
        Self { buf, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Replay<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buf.len() {
            let remaining = &this.buf[this.pos..];
            let n = remaining.len().min(out.remaining());
            out.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Replay<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_complete_request() {
        let raw = b"GET /api/v1/widgets HTTP/1.1\r\nHost: example.com\r\nAuthorization: Bearer tok\r\n\r\n";
        match parse(raw) {
            ParseOutcome::Complete(req) => {
                assert_eq!(req.method, "GET");
                assert_eq!(req.path, "/api/v1/widgets");
                assert_eq!(req.header("authorization"), Some("Bearer tok"));
            }
            _ => panic!("expected a complete parse"),
        }
    }

    #[test]
    fn test_parse_partial_request_awaits_more_bytes() {
        let raw = b"GET /foo HTTP/1.1\r\nHost: ex";
        assert!(matches!(parse(raw), ParseOutcome::Partial));
    }

    #[test]
    fn test_parse_garbage_is_not_http() {
        let raw = &[0xff, 0x00, 0x01, 0x02, 0x9c, 0x11][..];
        assert!(matches!(parse(raw), ParseOutcome::NotHttp));
    }

    #[tokio::test]
    async fn test_peek_request_assembles_across_reads() {
        let (mut a, mut b) = duplex(256);
        let writer = tokio::spawn(async move {
            a.write_all(b"GET /x HTTP/1.1\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            a.write_all(b"Host: h\r\n\r\n").await.unwrap();
        });
        let (consumed, req) = peek_request(&mut b, Duration::from_secs(1), 8192).await;
        writer.await.unwrap();
        let req = req.expect("request should parse");
        assert_eq!(req.path, "/x");
        assert_eq!(consumed, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    }

    #[tokio::test]
    async fn test_peek_request_times_out_on_non_http_stream() {
        let (mut a, mut b) = duplex(256);
        a.write_all(b"not http at all").await.unwrap();
        let (_consumed, req) = peek_request(&mut b, Duration::from_millis(50), 8192).await;
        assert!(req.is_none());
    }

    #[tokio::test]
    async fn test_replay_yields_buffered_bytes_then_inner_stream() {
        let (mut a, b) = duplex(256);
        a.write_all(b"live-bytes").await.unwrap();
        drop(a);
        let mut replay = Replay::new(b"consumed-".to_vec(), b);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut replay, &mut out).await.unwrap();
        assert_eq!(out, b"consumed-live-bytes");
    }
}
