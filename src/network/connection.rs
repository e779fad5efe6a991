//! Connection handling for the TCP link
//!
//! Manages individual peer connections, including:
//! - Frame encoding/decoding
//! - The version handshake
//! - Connection statistics

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::frame::{Envelope, Frame, FrameDecoder, FrameEncoder, FrameError};
use crate::protocol::PROTOCOL_VERSION;
use crate::transport::{ConnectionId, EndpointId, Packet, TransportError};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection closed")]
    Closed,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Ids the server assigned during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assigned {
    pub connection: ConnectionId,
    pub endpoint: EndpointId,
}

/// A framed connection to a remote peer
pub struct Connection {
    remote_addr: SocketAddr,
    stream: TcpStream,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    remote_name: Option<String>,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a new connection from an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            remote_addr,
            stream,
            encoder: FrameEncoder::new(max_frame_size),
            decoder: FrameDecoder::new(max_frame_size),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            remote_name: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Name the peer announced (server side, after handshake)
    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Perform the server-side handshake, handing the client its ids
    pub async fn handshake_server(&mut self, assigned: Assigned) -> ConnectionResult<()> {
        let envelope = self.recv().await?.ok_or_else(|| {
            ConnectionError::HandshakeFailed("Connection closed during handshake".to_string())
        })?;

        let (remote_version, name) = match envelope.frame {
            Frame::Hello {
                protocol_version,
                name,
            } => (protocol_version, name),
            _ => {
                return Err(ConnectionError::HandshakeFailed(
                    "Expected Hello frame".to_string(),
                ));
            }
        };

        if remote_version != PROTOCOL_VERSION {
            self.send(&Frame::HelloAck {
                protocol_version: PROTOCOL_VERSION,
                accepted: false,
                reason: Some(format!(
                    "Protocol version mismatch: expected {}, got {}",
                    PROTOCOL_VERSION, remote_version
                )),
                connection: assigned.connection,
                endpoint: assigned.endpoint,
            })
            .await?;

            return Err(ConnectionError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: remote_version,
            });
        }

        self.send(&Frame::HelloAck {
            protocol_version: PROTOCOL_VERSION,
            accepted: true,
            reason: None,
            connection: assigned.connection,
            endpoint: assigned.endpoint,
        })
        .await?;

        tracing::info!(
            "Handshake complete with {} ({}) as {}",
            name,
            self.remote_addr,
            assigned.connection
        );
        self.remote_name = Some(name);

        Ok(())
    }

    /// Perform the client-side handshake
    pub async fn handshake_client(&mut self, name: &str) -> ConnectionResult<Assigned> {
        self.send(&Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            name: name.to_string(),
        })
        .await?;

        let envelope = self.recv().await?.ok_or_else(|| {
            ConnectionError::HandshakeFailed("Connection closed during handshake".to_string())
        })?;

        match envelope.frame {
            Frame::HelloAck {
                protocol_version,
                accepted,
                reason,
                connection,
                endpoint,
            } => {
                if !accepted {
                    return Err(ConnectionError::HandshakeFailed(
                        reason.unwrap_or_else(|| "Connection rejected".to_string()),
                    ));
                }

                if protocol_version != PROTOCOL_VERSION {
                    return Err(ConnectionError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }

                tracing::info!("Handshake complete with {} as {}", self.remote_addr, connection);

                Ok(Assigned {
                    connection,
                    endpoint,
                })
            }
            _ => Err(ConnectionError::HandshakeFailed(
                "Expected HelloAck frame".to_string(),
            )),
        }
    }

    /// Send a frame
    pub async fn send(&mut self, frame: &Frame) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(frame, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }

    /// Receive a frame (returns None on a clean close)
    pub async fn recv(&mut self) -> ConnectionResult<Option<Envelope>> {
        loop {
            if let Some(envelope) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.frames_received += 1;
                return Ok(Some(envelope));
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Close the connection gracefully
    pub async fn close(&mut self, reason: &str) -> ConnectionResult<()> {
        self.send(&Frame::Disconnect {
            reason: reason.to_string(),
        })
        .await?;

        self.stream.shutdown().await?;

        Ok(())
    }
}

/// Queues frames for a connection's I/O task; usable from any thread
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Frame>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Queue a frame without waiting for the write
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.sender.send(frame).map_err(|_| TransportError::Closed)
    }

    /// Queue a channel packet
    pub fn send_packet(&self, packet: Packet) -> Result<(), TransportError> {
        self.send(Frame::Packet {
            channel: packet.channel.to_string(),
            payload: packet.payload.to_vec(),
        })
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Counts consecutive decode failures on one connection
#[derive(Debug)]
pub(crate) struct ErrorBudget {
    consecutive: u32,
    limit: u32,
}

impl ErrorBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit,
        }
    }

    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Record a failure; true once the limit is reached
    pub fn failure(&mut self) -> bool {
        self.consecutive += 1;
        self.limit > 0 && self.consecutive >= self.limit
    }
}
