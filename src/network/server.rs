//! Channel server
//!
//! Accepts client connections and processes the originating side of every channel
//! in the registry it is started with.

use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::connection::{Assigned, Connection, ConnectionError, ConnectionHandle, ErrorBudget};
use super::frame::Frame;
use super::{dispatch_inbound, NetworkConfig};
use crate::channel::ChannelRegistry;
use crate::protocol::Side;
use crate::transport::{
    ConnectionId, EndpointId, Packet, PartitionId, PeerInfo, PeerTable, Position, Target,
    TargetResolver, Transport, TransportError, TransportResult,
};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed the handshake
    ClientConnected {
        connection: ConnectionId,
        endpoint: EndpointId,
        addr: SocketAddr,
        name: String,
    },
    /// A client has disconnected
    ClientDisconnected {
        connection: ConnectionId,
        reason: String,
    },
    /// Server started
    Started { bind_addr: SocketAddr },
    /// Server stopped
    Stopped,
}

/// Information about a connected client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub connection: ConnectionId,
    pub endpoint: EndpointId,
    pub addr: SocketAddr,
    pub name: String,
}

/// The server's side of the transport: connection handles plus the peer table.
///
/// Channels created over it write through the handles and resolve targets
/// against the peer table.
#[derive(Debug, Default)]
pub struct ServerLink {
    peers: PeerTable,
    handles: SyncRwLock<HashMap<ConnectionId, (ConnectionHandle, ClientInfo)>>,
    next_id: AtomicU64,
}

impl ServerLink {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Report where a client's endpoint is, for proximity and partition targets
    pub fn update_location(
        &self,
        connection: ConnectionId,
        partition: PartitionId,
        position: Position,
    ) -> bool {
        self.peers.update_location(connection, partition, position)
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .handles
            .read()
            .values()
            .map(|(_, info)| info.clone())
            .collect();
        clients.sort_by_key(|info| info.connection);
        clients
    }

    fn assign(&self) -> Assigned {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Assigned {
            connection: ConnectionId(id),
            endpoint: EndpointId(id),
        }
    }

    fn attach(&self, info: ClientInfo, handle: ConnectionHandle) {
        self.peers.insert(
            info.connection,
            PeerInfo::new(info.endpoint, PartitionId::default()),
        );
        self.handles.write().insert(info.connection, (handle, info));
    }

    fn detach(&self, connection: ConnectionId) {
        if let Some((handle, _)) = self.handles.write().remove(&connection) {
            handle.mark_disconnected();
        }
        self.peers.remove(connection);
    }

    fn disconnect_all(&self, reason: &str) {
        for (handle, _) in self.handles.read().values() {
            let _ = handle.send(Frame::Disconnect {
                reason: reason.to_string(),
            });
        }
    }
}

impl Transport for ServerLink {
    fn send(&self, connection: ConnectionId, packet: Packet) -> TransportResult<()> {
        let handles = self.handles.read();
        let (handle, _) = handles
            .get(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        handle.send_packet(packet)
    }
}

impl TargetResolver for ServerLink {
    fn resolve(&self, target: &Target) -> TransportResult<Vec<ConnectionId>> {
        match target {
            Target::ToOriginatingEndpoint => Err(TransportError::UnsupportedTarget(target.kind())),
            _ => self.peers.resolve(target),
        }
    }

    fn endpoint_of(&self, connection: ConnectionId) -> Option<EndpointId> {
        self.peers.endpoint_of(connection)
    }
}

/// Channel server
pub struct Server {
    config: NetworkConfig,
    link: Arc<ServerLink>,
    event_tx: mpsc::Sender<ServerEvent>,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetworkConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            link: Arc::new(ServerLink::new()),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Transport and resolver for this server's channels
    pub fn link(&self) -> Arc<ServerLink> {
        self.link.clone()
    }

    /// A registry whose channels send through this server
    pub fn registry(&self) -> ChannelRegistry {
        ChannelRegistry::new(self.link.clone(), self.link.clone())
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start accepting clients; inbound packets are dispatched through `registry`
    pub async fn start(&mut self, registry: Arc<ChannelRegistry>) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let _ = self
            .event_tx
            .send(ServerEvent::Started {
                bind_addr: local_addr,
            })
            .await;

        let link = self.link.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);

                                let link = link.clone();
                                let registry = registry.clone();
                                let event_tx = event_tx.clone();
                                let config = config.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(
                                        stream,
                                        addr,
                                        link,
                                        registry,
                                        event_tx,
                                        config,
                                    ).await {
                                        tracing::error!("Client handler error: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            let _ = event_tx.send(ServerEvent::Stopped).await;
        });

        Ok(local_addr)
    }

    /// Stop the server and disconnect every client
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        self.link.disconnect_all("Server shutting down");

        Ok(())
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.link.clients()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Run one client connection until it closes
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    link: Arc<ServerLink>,
    registry: Arc<ChannelRegistry>,
    event_tx: mpsc::Sender<ServerEvent>,
    config: NetworkConfig,
) -> Result<(), ConnectionError> {
    let mut conn = Connection::new(stream, addr, config.max_frame_size);

    let assigned = link.assign();
    conn.handshake_server(assigned).await?;

    let name = conn.remote_name().unwrap_or_default().to_string();
    let connection = assigned.connection;

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();
    let handle = ConnectionHandle::new(frame_tx);

    link.attach(
        ClientInfo {
            connection,
            endpoint: assigned.endpoint,
            addr,
            name: name.clone(),
        },
        handle,
    );

    let _ = event_tx
        .send(ServerEvent::ClientConnected {
            connection,
            endpoint: assigned.endpoint,
            addr,
            name,
        })
        .await;

    let mut budget = ErrorBudget::new(config.max_protocol_errors);

    let disconnect_reason = loop {
        tokio::select! {
            result = conn.recv() => {
                match result {
                    Ok(Some(envelope)) => match envelope.frame {
                        Frame::Packet { channel, payload } => {
                            if let Some(reason) = dispatch_inbound(
                                &registry,
                                Side::Originating,
                                connection,
                                channel,
                                payload,
                                &mut budget,
                            ) {
                                break reason;
                            }
                        }
                        Frame::Disconnect { reason } => {
                            break reason;
                        }
                        other => {
                            tracing::warn!("Unexpected frame {:#04x} from {}", other.type_id(), connection);
                        }
                    },
                    Ok(None) => {
                        break "Connection closed".to_string();
                    }
                    Err(e) => {
                        break format!("Error: {}", e);
                    }
                }
            }

            Some(frame) = frame_rx.recv() => {
                let closing = matches!(frame, Frame::Disconnect { .. });
                if let Err(e) = conn.send(&frame).await {
                    break format!("Send error: {}", e);
                }
                if closing {
                    break "Server shutting down".to_string();
                }
            }
        }
    };

    link.detach(connection);

    tracing::info!("{} disconnected: {}", connection, disconnect_reason);
    tracing::debug!("{} traffic: {:?}", connection, conn.stats());
    let _ = event_tx
        .send(ServerEvent::ClientDisconnected {
            connection,
            reason: disconnect_reason,
        })
        .await;

    let _ = conn.close("Session ended").await;

    Ok(())
}
