//! Filebeam Relay
//!
//! Signaling relay for sender/receiver rendezvous. Clients connect over
//! WebSocket, join rooms keyed by a session `uid`, and the relay forwards
//! handshake messages, file metadata and raw file chunks to the other members
//! of a room.
//!
//! # Protocol
//!
//! 1. Sender joins its room with `sender-join`
//! 2. Receiver joins its own room and announces itself to the sender's room
//!    with `receiver-join`; the sender gets `init`
//! 3. File metadata flows as `file-meta` → `fs-meta`
//! 4. Transfer starts with `fs-start` and chunks flow as `file-raw`; both reach
//!    the peer as `fs-share`
//!
//! The same port also serves the client assets over plain HTTP.

pub mod assets;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod relay;
pub mod server;

pub use config::RelayConfig;
pub use error::{ConfigError, EventError, RelayError};
pub use events::{Envelope, OutboundEvent};
pub use hub::{HubHandle, RelayStats};
pub use relay::{ConnectionId, Delivery, Membership, Relay};
pub use server::RelayServer;

/// Default listening port
pub const DEFAULT_PORT: u16 = 5000;

/// Default directory for static client assets
pub const DEFAULT_PUBLIC_DIR: &str = "public";

/// Maximum size of an HTTP request head we inspect before deciding between
/// WebSocket and plain HTTP
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Time allowed for a client to send its request head
pub const REQUEST_HEAD_TIMEOUT_SECS: u64 = 10;
