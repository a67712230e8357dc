//! Reliable duplex byte-stream transport for LanForge.
//!
//! This crate is transport-agnostic at the trait level (mirroring the
//! teacher's `GossipTransport` split between transport and protocol): it
//! moves raw UTF-8 lines back and forth and knows nothing about frame
//! shapes. Encoding/decoding into `Frame`s lives in `lanforge-core`.
//!
//! Two implementations are provided:
//! - [`tcp`]: real TCP sockets, used in production.
//! - [`loopback`]: an in-memory pair of channels, used in tests and for the
//!   "self-host" case where a peer is both coordinator and client of its own
//!   room (spec's design note: two real instances over one connection, not
//!   an in-process shortcut).

pub mod loopback;
pub mod tcp;

use anyhow::Result;
use async_trait::async_trait;

/// Default port for the reliable coordinator transport.
pub const DEFAULT_COORDINATOR_PORT: u16 = 8080;

/// Default link-local discovery UDP port.
pub const DISCOVERY_PORT: u16 = 42069;

/// One open, ordered, duplex connection to a peer. Each side reads and
/// writes complete text lines; partial lines are never observed by callers.
#[async_trait]
pub trait Connection: Send {
    /// Sends one line (without a trailing newline; the implementation adds it).
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Receives the next complete line, or `Ok(None)` if the peer closed the
    /// connection cleanly.
    async fn recv_line(&mut self) -> Result<Option<String>>;

    /// Closes the connection from this side.
    async fn shutdown(&mut self) -> Result<()>;

    /// Best-effort description of the remote endpoint, for logging.
    fn peer_description(&self) -> String;
}

/// Accepts inbound connections on a bound address.
#[async_trait]
pub trait Listener: Send {
    /// Blocks until a new connection arrives.
    async fn accept(&mut self) -> Result<Box<dyn Connection>>;

    /// The address actually bound (useful when port 0 was requested).
    fn local_addr(&self) -> String;
}

/// Factory for binding a listener and for dialing out to a peer.
#[async_trait]
pub trait ReliableTransport: Send + Sync {
    async fn bind(&self, addr: &str) -> Result<Box<dyn Listener>>;
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>>;
}
