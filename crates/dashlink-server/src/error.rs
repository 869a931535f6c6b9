//! Error types for the panel endpoint.

use std::io;

use thiserror::Error;

/// Errors produced by the transport and protocol layers.
///
/// Transport failures (`Io`) end the connection they occurred on; frame and
/// decode failures are per-unit and the connection survives them unless the
/// underlying stream itself failed.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Underlying socket I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A malformed or oversized WebSocket frame.
    #[error("frame error: {0}")]
    Frame(String),

    /// A text frame that did not decode into a panel message.
    #[error("message decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// True for the error kinds a bounded read timeout produces.
///
/// Unix reports `WouldBlock` for an expired `SO_RCVTIMEO`, Windows reports
/// `TimedOut`; a non-blocking accept also reports `WouldBlock`.
pub(crate) fn is_would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
