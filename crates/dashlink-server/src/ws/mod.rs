//! Hand-built WebSocket wire protocol (RFC 6455).
//!
//! - **Frame codec** (`frame`): parse and write single data frames with the
//!   three payload-length encodings and XOR masking
//! - **Handshake** (`handshake`): polled HTTP upgrade with the
//!   `Sec-WebSocket-Accept` computation

pub mod frame;
pub mod handshake;

pub use frame::{apply_mask, read_frame, write_frame, WsFrame, WsOpcode};
pub use handshake::{compute_accept_key, try_handshake, HandshakeStatus};
