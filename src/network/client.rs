//! Channel client
//!
//! Connects to a channel server and processes the receiving side of every channel
//! in the registry it connects with.

use parking_lot::RwLock as SyncRwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use super::connection::{Assigned, Connection, ConnectionError, ConnectionHandle, ErrorBudget};
use super::frame::Frame;
use super::{dispatch_inbound, NetworkConfig};
use crate::channel::ChannelRegistry;
use crate::protocol::Side;
use crate::transport::{
    ConnectionId, EndpointId, Packet, PeerTable, Target, TargetResolver, Transport,
    TransportError, TransportResult,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed
    Connected {
        server_addr: SocketAddr,
        connection: ConnectionId,
        endpoint: EndpointId,
    },
    /// Disconnected from server
    Disconnected { reason: String },
    /// Connection error
    Error { message: String },
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// The client's side of the transport: its single server connection.
///
/// Only `ToOriginatingEndpoint` resolves here; a client cannot address other
/// endpoints directly.
#[derive(Debug, Default)]
pub struct ClientLink {
    peers: PeerTable,
    handle: SyncRwLock<Option<(ConnectionId, ConnectionHandle)>>,
}

impl ClientLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(&self) -> Option<ConnectionId> {
        self.peers.server()
    }

    fn attach(&self, connection: ConnectionId, handle: ConnectionHandle) {
        *self.handle.write() = Some((connection, handle));
        self.peers.set_server(Some(connection));
    }

    fn detach(&self) {
        if let Some((_, handle)) = self.handle.write().take() {
            handle.mark_disconnected();
        }
        self.peers.set_server(None);
    }
}

impl Transport for ClientLink {
    fn send(&self, connection: ConnectionId, packet: Packet) -> TransportResult<()> {
        match self.handle.read().as_ref() {
            Some((current, handle)) if *current == connection => handle.send_packet(packet),
            _ => Err(TransportError::UnknownConnection(connection)),
        }
    }
}

impl TargetResolver for ClientLink {
    fn resolve(&self, target: &Target) -> TransportResult<Vec<ConnectionId>> {
        match target {
            Target::ToOriginatingEndpoint => self.peers.resolve(target),
            other => Err(TransportError::UnsupportedTarget(other.kind())),
        }
    }

    fn endpoint_of(&self, _connection: ConnectionId) -> Option<EndpointId> {
        None
    }
}

/// Channel client
pub struct Client {
    config: NetworkConfig,
    name: String,
    link: Arc<ClientLink>,
    state: Arc<RwLock<ClientState>>,
    assigned: Option<Assigned>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Client {
    /// Create a new client announcing itself as `name`
    pub fn new(config: NetworkConfig, name: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            name: name.into(),
            link: Arc::new(ClientLink::new()),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            assigned: None,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
        }
    }

    pub fn link(&self) -> Arc<ClientLink> {
        self.link.clone()
    }

    /// A registry whose channels send through this client
    pub fn registry(&self) -> ChannelRegistry {
        ChannelRegistry::new(self.link.clone(), self.link.clone())
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Ids the server assigned on the last successful handshake
    pub fn assigned(&self) -> Option<Assigned> {
        self.assigned
    }

    /// Connect to a server; inbound packets are dispatched through `registry`
    pub async fn connect(
        &mut self,
        addr: SocketAddr,
        registry: Arc<ChannelRegistry>,
    ) -> ClientResult<Assigned> {
        {
            let state = self.state.read().await;
            if *state != ClientState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
        }

        {
            let mut state = self.state.write().await;
            *state = ClientState::Connecting;
        }

        tracing::info!("Connecting to {}", addr);

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(ClientError::Timeout);
            }
        };

        stream.set_nodelay(true)?;

        let mut conn = Connection::new(stream, addr, self.config.max_frame_size);

        let assigned = match conn.handshake_client(&self.name).await {
            Ok(assigned) => assigned,
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(ClientError::Connection(e));
            }
        };

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();
        self.link
            .attach(assigned.connection, ConnectionHandle::new(frame_tx));
        self.assigned = Some(assigned);

        {
            let mut state = self.state.write().await;
            *state = ClientState::Connected;
        }

        let _ = self
            .event_tx
            .send(ClientEvent::Connected {
                server_addr: addr,
                connection: assigned.connection,
                endpoint: assigned.endpoint,
            })
            .await;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let link = self.link.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let mut budget = ErrorBudget::new(self.config.max_protocol_errors);
        let connection = assigned.connection;

        tokio::spawn(async move {
            let disconnect_reason = loop {
                tokio::select! {
                    result = conn.recv() => {
                        match result {
                            Ok(Some(envelope)) => match envelope.frame {
                                Frame::Packet { channel, payload } => {
                                    if let Some(reason) = dispatch_inbound(
                                        &registry,
                                        Side::Receiving,
                                        connection,
                                        channel,
                                        payload,
                                        &mut budget,
                                    ) {
                                        break reason;
                                    }
                                }
                                Frame::Disconnect { reason } => {
                                    tracing::info!("Server disconnected: {}", reason);
                                    break reason;
                                }
                                other => {
                                    tracing::warn!("Unexpected frame {:#04x} from server", other.type_id());
                                }
                            },
                            Ok(None) => {
                                break "Connection closed by server".to_string();
                            }
                            Err(e) => {
                                tracing::error!("Receive error: {}", e);
                                let _ = event_tx.send(ClientEvent::Error {
                                    message: e.to_string(),
                                }).await;
                                break format!("Error: {}", e);
                            }
                        }
                    }

                    Some(frame) = frame_rx.recv() => {
                        if let Err(e) = conn.send(&frame).await {
                            tracing::error!("Send error: {}", e);
                            break format!("Send error: {}", e);
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        let _ = conn.close("Client disconnecting").await;
                        break "Client disconnected".to_string();
                    }
                }
            };

            link.detach();
            tracing::debug!("Session traffic: {:?}", conn.stats());

            {
                let mut s = state.write().await;
                *s = ClientState::Disconnected;
            }

            let _ = event_tx
                .send(ClientEvent::Disconnected {
                    reason: disconnect_reason,
                })
                .await;
        });

        Ok(assigned)
    }

    /// Connect using hostname
    pub async fn connect_hostname(
        &mut self,
        hostname: &str,
        registry: Arc<ChannelRegistry>,
    ) -> ClientResult<Assigned> {
        let addr = super::resolve_host(hostname, self.config.port).await?;
        self.connect(addr, registry).await
    }

    /// Disconnect from the server
    pub async fn disconnect(&mut self) -> ClientResult<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageContext;
    use crate::network::{Server, ServerEvent};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    crate::bincode_message!(Note);

    fn local_config() -> NetworkConfig {
        NetworkConfig::new(0).with_bind_address("127.0.0.1")
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = Client::new(NetworkConfig::default(), "test");
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert!(client.assigned().is_none());
    }

    #[test]
    fn test_link_only_reaches_server() {
        let link = ClientLink::new();
        assert_eq!(
            link.resolve(&Target::ToOriginatingEndpoint),
            Err(TransportError::NoServerConnection)
        );
        assert_eq!(
            link.resolve(&Target::All),
            Err(TransportError::UnsupportedTarget("all"))
        );
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let mut server = Server::new(local_config());
        let mut server_events = server.take_event_receiver().unwrap();
        let server_registry = Arc::new(server.registry());
        let echo = server_registry.new_channel("echo").unwrap();
        echo.register_fn(
            |note: Note, ctx: &mut MessageContext| {
                ctx.reply(Note {
                    text: note.text.to_uppercase(),
                });
                Ok(())
            },
            1,
            Side::Originating,
        )
        .unwrap();
        echo.register_fn(|_: Note, _: &mut MessageContext| Ok(()), 2, Side::Receiving)
            .unwrap();

        let addr = server.start(server_registry.clone()).await.unwrap();
        assert!(matches!(
            server_events.recv().await,
            Some(ServerEvent::Started { .. })
        ));

        let mut client = Client::new(local_config(), "tester");
        let client_registry = Arc::new(client.registry());
        let client_echo = client_registry.new_channel("echo").unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        client_echo
            .register_fn(|_: Note, _: &mut MessageContext| Ok(()), 1, Side::Originating)
            .unwrap();
        client_echo
            .register_fn(
                move |note: Note, _: &mut MessageContext| {
                    let _ = seen_tx.send(note.text);
                    Ok(())
                },
                2,
                Side::Receiving,
            )
            .unwrap();

        let assigned = client.connect(addr, client_registry).await.unwrap();
        assert!(client.is_connected().await);
        assert_eq!(client.link().server(), Some(assigned.connection));

        match server_events.recv().await {
            Some(ServerEvent::ClientConnected { connection, name, .. }) => {
                assert_eq!(connection, assigned.connection);
                assert_eq!(name, "tester");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(
            client_echo
                .send_to_server(&Note {
                    text: "hello".into()
                })
                .unwrap(),
            1
        );

        let reply = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("HELLO"));
        assert_eq!(echo.stats(Side::Originating).received, 1);

        client.disconnect().await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), server_events.recv())
            .await
            .unwrap()
        {
            Some(ServerEvent::ClientDisconnected { connection, .. }) => {
                assert_eq!(connection, assigned.connection)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(server.clients().is_empty());

        server.stop().await.unwrap();
    }
}
