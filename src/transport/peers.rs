//! Peer table
//!
//! In-memory record of which endpoint sits behind which connection, and where it is.
//! Resolves target descriptors for transports that keep no richer model.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{
    ConnectionId, EndpointId, PartitionId, Position, Target, TargetResolver, TransportError,
    TransportResult,
};

/// What the table knows about a connected peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub endpoint: EndpointId,
    pub partition: PartitionId,
    /// `None` until the application reports a position
    pub position: Option<Position>,
}

impl PeerInfo {
    pub fn new(endpoint: EndpointId, partition: PartitionId) -> Self {
        Self {
            endpoint,
            partition,
            position: None,
        }
    }
}

#[derive(Debug, Default)]
struct Peers {
    peers: BTreeMap<ConnectionId, PeerInfo>,
    server: Option<ConnectionId>,
}

/// Connection-to-endpoint table implementing [`TargetResolver`]
#[derive(Debug, Default)]
pub struct PeerTable {
    inner: RwLock<Peers>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: ConnectionId, info: PeerInfo) {
        self.inner.write().peers.insert(connection, info);
    }

    pub fn remove(&self, connection: ConnectionId) -> Option<PeerInfo> {
        let mut inner = self.inner.write();
        if inner.server == Some(connection) {
            inner.server = None;
        }
        inner.peers.remove(&connection)
    }

    pub fn get(&self, connection: ConnectionId) -> Option<PeerInfo> {
        self.inner.read().peers.get(&connection).cloned()
    }

    /// Move a peer; returns false if the connection is unknown
    pub fn update_location(
        &self,
        connection: ConnectionId,
        partition: PartitionId,
        position: Position,
    ) -> bool {
        match self.inner.write().peers.get_mut(&connection) {
            Some(info) => {
                info.partition = partition;
                info.position = Some(position);
                true
            }
            None => false,
        }
    }

    /// Record the connection to the server (client-side tables)
    pub fn set_server(&self, connection: Option<ConnectionId>) {
        self.inner.write().server = connection;
    }

    pub fn server(&self) -> Option<ConnectionId> {
        self.inner.read().server
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner.read().peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }
}

impl TargetResolver for PeerTable {
    fn resolve(&self, target: &Target) -> TransportResult<Vec<ConnectionId>> {
        let inner = self.inner.read();
        let select = |keep: &dyn Fn(&PeerInfo) -> bool| -> Vec<ConnectionId> {
            inner
                .peers
                .iter()
                .filter(|(_, info)| keep(info))
                .map(|(conn, _)| *conn)
                .collect()
        };

        match target {
            Target::All => Ok(select(&|_| true)),
            Target::Single(endpoint) => {
                let found = select(&|info| info.endpoint == *endpoint);
                if found.is_empty() {
                    Err(TransportError::UnknownEndpoint(*endpoint))
                } else {
                    Ok(found)
                }
            }
            Target::AroundPoint(point) => Ok(select(&|info| {
                info.position
                    .map(|pos| point.contains(info.partition, pos))
                    .unwrap_or(false)
            })),
            Target::Partition(partition) => Ok(select(&|info| info.partition == *partition)),
            Target::ToOriginatingEndpoint => inner
                .server
                .map(|conn| vec![conn])
                .ok_or(TransportError::NoServerConnection),
        }
    }

    fn endpoint_of(&self, connection: ConnectionId) -> Option<EndpointId> {
        self.inner.read().peers.get(&connection).map(|info| info.endpoint)
    }
}
