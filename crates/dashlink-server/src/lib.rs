//! Embedded control-panel endpoint for a running game process.
//!
//! dashlink lets an external dashboard observe and drive a game without
//! touching the game's own UI. The transport is a hand-built WebSocket
//! server over raw loopback sockets: an HTTP upgrade handshake, a frame
//! codec, a per-client delivery queue, and a typed JSON message protocol
//! layered on top. Everything runs on its own threads so the host's main
//! loop is never blocked.
//!
//! ## Modules
//!
//! - [`ws`]: RFC 6455 wire protocol (frame codec and upgrade handshake)
//! - [`registry`]: concurrency-safe client registry and delivery queues
//! - [`server`]: accept/connection loops and the [`server::PanelServer`] facade
//! - [`error`]: the crate error type
//!
//! The message types themselves live in the `dashlink-proto` crate.

pub mod error;
pub mod registry;
pub mod server;
pub mod ws;

pub use error::ServerError;
pub use registry::ClientId;
pub use server::{PanelEvents, PanelServer, PANEL_PORT};
