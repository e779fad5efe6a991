//! Network module - Reference TCP transport for channels
//!
//! Provides:
//! - Server (originating side) accepting client connections
//! - Client (receiving side) connecting to a server
//! - Framing, handshake and per-connection I/O tasks
//!
//! Inbound packets are dispatched inline on each connection's task.

mod client;
mod connection;
mod frame;
mod server;

pub use client::*;
pub use connection::*;
pub use frame::*;
pub use server::*;

use bytes::Bytes;
use std::net::SocketAddr;

use crate::channel::{ChannelRegistry, Outcome};
use crate::protocol::{Side, DEFAULT_PORT};
use crate::transport::{ConnectionId, Packet};

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Interface to bind to
    pub bind_address: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Maximum frame body size
    pub max_frame_size: usize,
    /// Consecutive inbound decode failures before a connection is dropped (0 = never)
    pub max_protocol_errors: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            connect_timeout_ms: 5000,
            max_frame_size: MAX_FRAME_SIZE,
            max_protocol_errors: 16,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Hand one inbound packet to the registry on the connection's task.
///
/// Failures take the transport error path: logged, and counted against the
/// connection's budget. Returns a disconnect reason once the budget is spent.
pub(crate) fn dispatch_inbound(
    registry: &ChannelRegistry,
    side: Side,
    connection: ConnectionId,
    channel: String,
    payload: Vec<u8>,
    budget: &mut ErrorBudget,
) -> Option<String> {
    match registry.dispatch(side, connection, Packet::new(channel, Bytes::from(payload))) {
        Ok(outcome) => {
            budget.success();
            if let Outcome::Unhandled { discriminator } = outcome {
                tracing::debug!(
                    "Discriminator {} from {} is not handled on the {} side",
                    discriminator,
                    connection,
                    side
                );
            }
            None
        }
        Err(e) if e.is_decode_failure() => {
            tracing::warn!("Dropped malformed packet from {}: {}", connection, e);
            if budget.failure() {
                Some(format!("Too many protocol errors, last: {}", e))
            } else {
                None
            }
        }
        Err(e) => {
            tracing::error!("Packet from {} failed: {}", connection, e);
            None
        }
    }
}
