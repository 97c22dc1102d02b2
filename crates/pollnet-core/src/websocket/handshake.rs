//! The HTTP/1.1 upgrade handshake (RFC 6455 §4.2).
//!
//! ```text
//! GET /chat?token=abc HTTP/1.1
//! Host: example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! The server answers with `101 Switching Protocols` and
//! `Sec-WebSocket-Accept: base64(SHA-1(key + GUID))`.  Nothing else about
//! HTTP is implemented: no routing by path, no extensions, no subprotocols.

use std::io::Read;

use base64::Engine;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::ProtocolError;

/// The fixed GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default cap on the size of an upgrade request.
pub const DEFAULT_HANDSHAKE_LIMIT: usize = 8 * 1024;

/// Computes `Sec-WebSocket-Accept` for a client key.
///
/// # Examples
///
/// ```rust
/// use pollnet_core::accept_key;
///
/// assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(sha.finalize())
}

/// Builds the `101 Switching Protocols` response.
pub fn switching_protocols_response(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
    .into_bytes()
}

/// Builds the response sent before closing a connection whose upgrade
/// request was rejected.
pub fn bad_request_response() -> Vec<u8> {
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n".to_vec()
}

// ── Query string ──────────────────────────────────────────────────────────────

/// Decoded query-string parameters from the upgrade request path.
///
/// Keys may repeat (`?tag=a&tag=b`); [`get`](QueryParams::get) returns the
/// first value, [`get_all`](QueryParams::get_all) every value in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Parses `a=1&b=two%20words&flag`.
    pub fn parse(query: &str) -> Self {
        let pairs = query
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((k, v)) => (percent_decode(k), percent_decode(v)),
                None => (percent_decode(part), String::new()),
            })
            .collect();
        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// `application/x-www-form-urlencoded` decoding: `+` is a space, `%XX` a byte.
/// Malformed escapes are kept literally.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// ── Request parsing ───────────────────────────────────────────────────────────

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request path without the query string.
    pub path: String,
    /// `Sec-WebSocket-Key` as sent by the client.
    pub key: String,
    /// Decoded query-string parameters.
    pub query: QueryParams,
}

impl HandshakeRequest {
    /// Parses and validates the request head (everything before `\r\n\r\n`).
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Handshake`] when the request is not a `GET` WebSocket
    /// upgrade carrying a `Sec-WebSocket-Key`.
    pub fn parse(head: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| ProtocolError::Handshake("request head is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) => (m, t, v),
            _ => {
                return Err(ProtocolError::Handshake(format!(
                    "malformed request line: {request_line:?}"
                )))
            }
        };
        if method != "GET" {
            return Err(ProtocolError::Handshake(format!("method {method} is not GET")));
        }
        if !version.starts_with("HTTP/1.") {
            return Err(ProtocolError::Handshake(format!("unsupported version {version}")));
        }

        let mut key = None;
        let mut upgrade = false;
        let mut ws_version = None;
        for line in lines.filter(|l| !l.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                return Err(ProtocolError::Handshake(format!("malformed header: {line:?}")));
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("sec-websocket-key") {
                key = Some(value.to_owned());
            } else if name.eq_ignore_ascii_case("upgrade") {
                upgrade = value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"));
            } else if name.eq_ignore_ascii_case("sec-websocket-version") {
                ws_version = Some(value.to_owned());
            }
        }

        if !upgrade {
            return Err(ProtocolError::Handshake("missing `Upgrade: websocket`".into()));
        }
        if let Some(v) = ws_version.as_deref() {
            if v != "13" {
                return Err(ProtocolError::Handshake(format!("unsupported websocket version {v}")));
            }
        }
        let key = match key {
            Some(k) if is_valid_key(&k) => k,
            Some(k) => return Err(ProtocolError::Handshake(format!("malformed key {k:?}"))),
            None => return Err(ProtocolError::Handshake("missing Sec-WebSocket-Key".into())),
        };

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, QueryParams::parse(q)),
            None => (target, QueryParams::default()),
        };

        Ok(Self {
            path: path.to_owned(),
            key,
            query,
        })
    }

    /// The complete 101 response for this request.
    pub fn response(&self) -> Vec<u8> {
        switching_protocols_response(&accept_key(&self.key))
    }
}

/// A key is the base64 encoding of 16 bytes: 24 characters ending in `==`.
fn is_valid_key(key: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(key)
        .map(|raw| raw.len() == 16)
        .unwrap_or(false)
}

// ── Incremental reading ───────────────────────────────────────────────────────

/// Accumulates the upgrade request across non-blocking reads.
///
/// Reads are bounded: a request that has not terminated within `limit`
/// bytes fails with [`ProtocolError::HandshakeTooLarge`].  Bytes read past the
/// blank line (a client that pipelines its first frame) are returned to the
/// caller so they can be fed to the frame decoder.
#[derive(Debug)]
pub struct HandshakeBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for HandshakeBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_LIMIT)
    }
}

impl HandshakeBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(512),
            limit,
        }
    }

    /// Performs one read; returns the parsed request and any trailing bytes
    /// once the request head is complete.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Eof`], [`ProtocolError::HandshakeTooLarge`], parse
    /// errors, or the read error itself (check `is_would_block`).
    pub fn read_from<R: Read + ?Sized>(
        &mut self,
        src: &mut R,
    ) -> Result<Option<(HandshakeRequest, Vec<u8>)>, ProtocolError> {
        let filled = self.buf.len();
        let room = self.limit.saturating_sub(filled);
        if room == 0 {
            return Err(ProtocolError::HandshakeTooLarge { limit: self.limit });
        }

        self.buf.resize(filled + room.min(1024), 0);
        let n = match src.read(&mut self.buf[filled..]) {
            Ok(n) => n,
            Err(e) => {
                self.buf.truncate(filled);
                return Err(e.into());
            }
        };
        self.buf.truncate(filled + n);
        if n == 0 {
            return Err(ProtocolError::Eof);
        }

        // Resume the terminator search a few bytes back in case it straddles reads.
        let from = filled.saturating_sub(3);
        let Some(pos) = find_terminator(&self.buf[from..]).map(|p| p + from) else {
            if self.buf.len() >= self.limit {
                return Err(ProtocolError::HandshakeTooLarge { limit: self.limit });
            }
            return Ok(None);
        };

        let request = HandshakeRequest::parse(&self.buf[..pos]).map_err(|e| {
            debug!("rejecting upgrade request: {e}");
            e
        })?;
        let rest = self.buf[pos + 4..].to_vec();
        self.buf = Vec::new();
        Ok(Some((request, rest)))
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
