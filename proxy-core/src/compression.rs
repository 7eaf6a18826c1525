//! Compression engine
//!
//! Negotiates an encoding from the client's
//! `Accept-Encoding` header (with quality values), applies a size window
//! and content-type allowlist, and falls back to the original payload when
//! the negotiated quality is below the configured threshold. Unlike the
//! admin surface's `tower_http::CompressionLayer` (still used in
//! `admin.rs`), this operates on arbitrary proxied response bytes, so it
//! calls the codec crates directly.

use std::io::Write;

use crate::config::CompressionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Gzip,
    Brotli,
    Deflate,
}

impl Algorithm {
    fn token(self) -> &'static str {
        match self {
            Algorithm::Gzip => "gzip",
            Algorithm::Brotli => "br",
            Algorithm::Deflate => "deflate",
        }
    }

    fn from_token(s: &str) -> Option<Algorithm> {
        match s {
            "gzip" => Some(Algorithm::Gzip),
            "br" => Some(Algorithm::Brotli),
            "deflate" => Some(Algorithm::Deflate),
            _ => None,
        }
    }
}

/// One `Accept-Encoding` entry: a token plus its optional `q` value
/// (defaults to 1.0 when absent).
#[derive(Debug, Clone, PartialEq)]
struct EncodingPreference {
    token: String,
    quality: f64,
}

fn parse_accept_encoding(header: &str) -> Vec<EncodingPreference> {
    header
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let mut segments = part.split(';');
            let token = segments.next()?.trim().to_string();
            let quality = segments
                .next()
                .and_then(|q| q.trim().strip_prefix("q="))
                .and_then(|q| q.parse::<f64>().ok())
                .unwrap_or(1.0);
            Some(EncodingPreference { token, quality })
        })
        .collect()
}

pub struct CompressionEngine {
    config: CompressionConfig,
    enabled_algorithms: Vec<Algorithm>,
}

impl CompressionEngine {
    pub fn new(config: CompressionConfig) -> Self {
        let enabled_algorithms = config
            .enabled_algorithms
            .iter()
            .filter_map(|s| Algorithm::from_token(s))
            .collect();
        Self { config, enabled_algorithms }
    }

    /// Negotiate the best mutually-acceptable algorithm from an
    /// `Accept-Encoding` header, respecting quality values and falling
    /// back to `None` (meaning: send uncompressed) below the configured
    /// quality threshold or on an explicit `identity;q=... ` / no match.
    pub fn negotiate(&self, accept_encoding: &str) -> Option<Algorithm> {
        let mut preferences = parse_accept_encoding(accept_encoding);
        preferences.sort_by(|a, b| b.quality.partial_cmp(&a.quality).unwrap_or(std::cmp::Ordering::Equal));

        preferences.into_iter().find_map(|pref| {
            if pref.quality < self.config.quality_threshold || pref.quality == 0.0 {
                return None;
            }
            let algo = Algorithm::from_token(&pref.token)?;
            self.enabled_algorithms.contains(&algo).then_some(algo)
        })
    }

    fn content_type_eligible(&self, content_type: &str) -> bool {
        self.config.content_type_includes.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                content_type.starts_with(prefix)
            } else {
                content_type == pattern
            }
        })
    }

    fn size_eligible(&self, len: usize) -> bool {
        len >= self.config.min_bytes && len <= self.config.max_bytes
    }

    /// Compress `body` if it's within the configured size window and
    /// content-type allowlist and the client accepts a supported
    /// algorithm; otherwise returns the original bytes and `None`.
    pub fn compress(&self, body: &[u8], content_type: &str, accept_encoding: &str) -> (Vec<u8>, Option<Algorithm>) {
        if !self.config.enabled || !self.size_eligible(body.len()) || !self.content_type_eligible(content_type) {
            return (body.to_vec(), None);
        }
        match self.negotiate(accept_encoding) {
            Some(algo) => (encode(algo, body), Some(algo)),
            None => (body.to_vec(), None),
        }
    }
}

fn encode(algo: Algorithm, body: &[u8]) -> Vec<u8> {
    match algo {
        Algorithm::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body).expect("in-memory gzip write cannot fail");
            encoder.finish().expect("in-memory gzip finish cannot fail")
        }
        Algorithm::Deflate => {
            let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body).expect("in-memory deflate write cannot fail");
            encoder.finish().expect("in-memory deflate finish cannot fail")
        }
        Algorithm::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut std::io::Cursor::new(body), &mut out, &params)
                .expect("in-memory brotli compress cannot fail");
            out
        }
    }
}
