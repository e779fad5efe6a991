//! Transport module - Collaborator interfaces consumed by channels
//!
//! Provides:
//! - Packets, connection and endpoint identifiers
//! - Outbound target descriptors and their resolution to connections
//! - An in-memory transport for embedders and tests

mod memory;
mod peers;
mod target;

pub use memory::*;
pub use peers::*;
pub use target::*;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),

    #[error("No connection to the server")]
    NoServerConnection,

    #[error("Target {0} is not supported by this transport")]
    UnsupportedTarget(&'static str),

    #[error("Connection closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// One physical connection, as numbered by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Opaque identity of the application object behind a connection (e.g. a player)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint#{}", self.0)
    }
}

/// Opaque partition (dimension) identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub i32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition#{}", self.0)
    }
}

/// An encoded message ready for a transport, tagged with its channel name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: Arc<str>,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(channel: impl Into<Arc<str>>, payload: Bytes) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Writes encoded packets to physical connections.
///
/// Framing, compression, flow control and encryption belong to the implementor.
pub trait Transport: Send + Sync {
    fn send(&self, connection: ConnectionId, packet: Packet) -> TransportResult<()>;
}

/// Expands target descriptors into connections and identifies the endpoint behind a
/// connection.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, target: &Target) -> TransportResult<Vec<ConnectionId>>;

    fn endpoint_of(&self, connection: ConnectionId) -> Option<EndpointId>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, connection: ConnectionId, packet: Packet) -> TransportResult<()> {
        (**self).send(connection, packet)
    }
}

impl<R: TargetResolver + ?Sized> TargetResolver for Arc<R> {
    fn resolve(&self, target: &Target) -> TransportResult<Vec<ConnectionId>> {
        (**self).resolve(target)
    }

    fn endpoint_of(&self, connection: ConnectionId) -> Option<EndpointId> {
        (**self).endpoint_of(connection)
    }
}
