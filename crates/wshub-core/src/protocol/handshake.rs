//! HTTP/1.1 Upgrade handshake (RFC 6455 §4.2), server side.
//!
//! A client opens the connection with a plain HTTP request:
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! The server only insists on two headers: `Sec-WebSocket-Version` must be
//! `13` and `Sec-WebSocket-Key` must be present.  Everything else (method,
//! path, `Upgrade`, `Connection`) is accepted as sent.
//!
//! This module is pure: it turns request bytes into response bytes.  Writing
//! the response to a socket and closing rejected connections is the caller's
//! job.

use std::time::Duration;

use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const SUPPORTED_VERSION: &str = "13";

/// Marks the end of the HTTP header block.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Reasons an upgrade request is refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The request is not valid UTF-8 or has no request line.
    #[error("malformed upgrade request: {0}")]
    MalformedRequest(String),

    /// A required header is absent (or empty).
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// `Sec-WebSocket-Version` is something other than 13.
    #[error("unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),

    /// The header block grew past the configured limit before `\r\n\r\n`.
    #[error("upgrade request exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// The header block did not finish arriving in time.
    #[error("upgrade request incomplete after {0:?}")]
    TimedOut(Duration),
}

/// Outcome of running the handshake against a complete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// The request is a valid version-13 upgrade; send `response` and switch
    /// the connection to frame mode.
    Accepted { accept_key: String, response: Vec<u8> },
    /// The request was refused; send `response` (HTTP 400) and close.
    Rejected { reason: HandshakeError, response: Vec<u8> },
}

impl Negotiation {
    /// Bytes to write back to the client, whatever the outcome.
    pub fn response(&self) -> &[u8] {
        match self {
            Self::Accepted { response, .. } | Self::Rejected { response, .. } => response,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Computes `base64(SHA1(key + GUID))`.
///
/// # Examples
///
/// ```rust
/// use wshub_core::protocol::handshake::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Returns the length of the request (including the blank line) once the
/// full header block is in `buf`.
pub fn find_request_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Validates a complete upgrade request and builds the HTTP response.
///
/// Never fails: a bad request produces [`Negotiation::Rejected`] carrying an
/// HTTP 400 response.
pub fn negotiate(raw_request: &[u8]) -> Negotiation {
    match validate(raw_request) {
        Ok(accept_key) => {
            let response = switching_protocols_response(&accept_key);
            Negotiation::Accepted {
                accept_key,
                response,
            }
        }
        Err(reason) => {
            debug!("rejecting upgrade request: {reason}");
            reject(reason)
        }
    }
}

/// Builds the rejection for `reason` without looking at a request.
///
/// Used when the request never completes (too large, timed out).
pub fn reject(reason: HandshakeError) -> Negotiation {
    Negotiation::Rejected {
        reason,
        response: bad_request_response(),
    }
}

/// `HTTP/1.1 101 Switching Protocols` with the computed accept key.
pub fn switching_protocols_response(accept_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )
    .into_bytes()
}

/// `HTTP/1.1 400 Bad Request`.
pub fn bad_request_response() -> Vec<u8> {
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n".to_vec()
}

// ── Request parsing ───────────────────────────────────────────────────────────

/// Returns the accept key for a valid request.
fn validate(raw_request: &[u8]) -> Result<String, HandshakeError> {
    let request = UpgradeRequest::parse(raw_request)?;

    let version = request
        .header("sec-websocket-version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != SUPPORTED_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }

    let key = request
        .header("sec-websocket-key")
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;

    Ok(compute_accept_key(key))
}

/// Request line plus headers of an upgrade request.
#[derive(Debug)]
struct UpgradeRequest<'a> {
    headers: Vec<(&'a str, &'a str)>,
}

impl<'a> UpgradeRequest<'a> {
    fn parse(raw: &'a [u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| HandshakeError::MalformedRequest(format!("not UTF-8: {e}")))?;

        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        if request_line.split_whitespace().count() < 3 {
            return Err(HandshakeError::MalformedRequest(format!(
                "bad request line: '{request_line}'"
            )));
        }

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim(), value.trim()))
            .collect();

        Ok(Self { headers })
    }

    /// Case-insensitive header lookup; the first occurrence wins.
    fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
