//! In-memory transport
//!
//! Accepts every write for a set of open connections and keeps it for inspection.

use parking_lot::Mutex;
use std::collections::BTreeSet;

use super::{ConnectionId, Packet, Transport, TransportError, TransportResult};

/// Transport that records packets instead of writing them to sockets
#[derive(Debug, Default)]
pub struct MemoryTransport {
    open: Mutex<BTreeSet<ConnectionId>>,
    sent: Mutex<Vec<(ConnectionId, Packet)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connections(connections: impl IntoIterator<Item = ConnectionId>) -> Self {
        let transport = Self::new();
        transport.open.lock().extend(connections);
        transport
    }

    pub fn open(&self, connection: ConnectionId) {
        self.open.lock().insert(connection);
    }

    pub fn close(&self, connection: ConnectionId) {
        self.open.lock().remove(&connection);
    }

    /// Drain everything written so far, in write order
    pub fn take_sent(&self) -> Vec<(ConnectionId, Packet)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, connection: ConnectionId, packet: Packet) -> TransportResult<()> {
        if !self.open.lock().contains(&connection) {
            return Err(TransportError::UnknownConnection(connection));
        }
        self.sent.lock().push((connection, packet));
        Ok(())
    }
}
