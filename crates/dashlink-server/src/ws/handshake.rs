//! WebSocket HTTP upgrade handshake (RFC 6455 Section 4.2).
//!
//! The negotiator is polled rather than blocking: each attempt looks at
//! whatever bytes are available on the socket and either completes the
//! upgrade, defers until more bytes arrive, or silently discards a
//! non-upgrade request and waits for the next one. There is no timeout or
//! retry cap; a socket that never upgrades is only released when the
//! server stops.
//!
//! - [`try_handshake`]: one polled upgrade attempt against a live socket
//! - [`compute_accept_key`]: SHA-1 + Base64 per RFC 6455 Section 4.2.2
//! - [`parse_upgrade_request`] / [`build_upgrade_response`]: the pure halves

use std::io::{self, Read, Write};
use std::net::TcpStream;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::debug;
use sha1::{Digest, Sha1};

use crate::error::{is_would_block, ServerError};

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Outcome of one handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Not enough data yet, or the bytes on hand were not an upgrade
    /// request. Poll again later.
    Pending,
    /// The 101 response has been written; the connection is upgraded.
    Complete,
}

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
///
/// Concatenates `client_key` + [`WS_GUID`], SHA-1 hashes, then Base64
/// encodes.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Extract the trimmed `Sec-WebSocket-Key` value from a raw upgrade request.
///
/// Returns `None` when the bytes are not a GET request or carry no key
/// header; either way the attempt is abandoned and retried on fresh bytes.
pub(crate) fn parse_upgrade_request(request: &str) -> Option<String> {
    if request.len() < 3 || !request.as_bytes()[..3].eq_ignore_ascii_case(b"GET") {
        return None;
    }
    for line in request.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Sec-WebSocket-Key") {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Build the byte-exact `101 Switching Protocols` response.
pub(crate) fn build_upgrade_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key
    )
}

/// Attempt the upgrade handshake on a polled connection.
///
/// Fewer than 3 bytes available: defers without consuming anything, so a
/// request split across arrivals gets another chance. Otherwise the
/// available bytes are consumed; anything that is not a GET carrying a
/// `Sec-WebSocket-Key` is discarded and the next attempt starts over on
/// whatever arrives next.
///
/// The 101 response is written straight to the socket: the protocol is not
/// upgraded yet, so the outbound message queue is bypassed.
pub fn try_handshake(stream: &mut TcpStream) -> Result<HandshakeStatus, ServerError> {
    let mut peeked = [0u8; 4096];
    let available = match stream.peek(&mut peeked) {
        Ok(0) => {
            // A readable socket with nothing to read is a closed peer.
            return Err(ServerError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(n) => n,
        Err(e) if is_would_block(&e) => return Ok(HandshakeStatus::Pending),
        Err(e) => return Err(e.into()),
    };
    if available < 3 {
        return Ok(HandshakeStatus::Pending);
    }

    let mut request_bytes = vec![0u8; available];
    stream.read_exact(&mut request_bytes)?;
    let request = String::from_utf8_lossy(&request_bytes);

    let client_key = match parse_upgrade_request(&request) {
        Some(key) => key,
        None => {
            debug!(
                "discarding {} non-upgrade bytes during handshake",
                request_bytes.len()
            );
            return Ok(HandshakeStatus::Pending);
        }
    };

    let response = build_upgrade_response(&compute_accept_key(&client_key));
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(HandshakeStatus::Complete)
}
