//! Channel module - Typed message multiplexing over one named channel
//!
//! Provides:
//! - Message registration (codec binding plus dispatch stage)
//! - Inbound decode and dispatch with staged replies
//! - Addressed outbound sends
//! - A registry of channels sharing one transport

mod context;
mod dispatch;
mod registry;
mod schedule;

pub use context::*;
pub use dispatch::*;
pub use registry::*;
pub use schedule::*;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::{
    AnyMessage, CodecError, Discriminator, IndexedCodec, Message, Side, MAX_CHANNEL_NAME_LEN,
};
use crate::transport::{
    ConnectionId, EndpointId, Packet, PartitionId, Target, TargetPoint, TargetResolver, Transport,
    TransportError,
};

/// Channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Handler for discriminator {discriminator} ({message_type}) failed: {source}")]
    HandlerFailure {
        discriminator: Discriminator,
        message_type: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No task scheduler installed for the {0} side")]
    NoScheduler(Side),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Invalid channel name {name:?}: {reason}")]
    InvalidChannelName { name: String, reason: &'static str },

    #[error("Channel {0:?} already exists")]
    DuplicateChannel(String),

    #[error("Unknown channel {0:?}")]
    UnknownChannel(String),
}

impl ChannelError {
    /// A malformed or unexpected inbound message; repeated occurrences suggest the
    /// peers disagree on the protocol
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            ChannelError::Codec(
                CodecError::TruncatedMessage
                    | CodecError::UnregisteredType(_)
                    | CodecError::Payload { .. }
            ) | ChannelError::UnknownChannel(_)
        )
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Terminal state of one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled, nothing staged
    Done,
    /// Handled, and the staged reply was written back to the sender
    ReplySent,
    /// No stage accepts this discriminator on this side
    Unhandled { discriminator: Discriminator },
}

/// Per-side counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    /// Packets handed to `handle_inbound`
    pub received: u64,
    /// Packets written to a connection
    pub sent: u64,
    /// Decoded messages no stage accepted
    pub unhandled: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct SideStats {
    received: AtomicU64,
    sent: AtomicU64,
    unhandled: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
}

impl SideStats {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// One direction of the channel
#[derive(Default)]
struct SideChannel {
    scheduler: RwLock<Option<Arc<dyn TaskScheduler>>>,
    stats: SideStats,
}

struct ChannelState {
    codec: IndexedCodec,
    pipeline: Pipeline,
}

/// State shared by a wrapper, its handler contexts and repliers
pub(crate) struct ChannelShared {
    name: Arc<str>,
    state: RwLock<ChannelState>,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn TargetResolver>,
    sides: [SideChannel; 2],
}

impl ChannelShared {
    fn side(&self, side: Side) -> &SideChannel {
        &self.sides[side.index()]
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn endpoint_of(&self, connection: ConnectionId) -> Option<EndpointId> {
        self.resolver.endpoint_of(connection)
    }

    pub(crate) fn scheduler(&self, side: Side) -> Option<Arc<dyn TaskScheduler>> {
        self.side(side).scheduler.read().clone()
    }

    /// Encode a message to be processed on `processing`
    pub(crate) fn encode_for(&self, message: &dyn AnyMessage, processing: Side) -> ChannelResult<Packet> {
        let payload = self.state.read().codec.encode_any(message, processing)?;
        Ok(Packet::new(self.name.clone(), payload))
    }

    /// Encode a reply to a message that arrived as `inbound` and was processed on `side`
    pub(crate) fn encode_reply(
        &self,
        message: &dyn AnyMessage,
        side: Side,
        inbound: Discriminator,
    ) -> ChannelResult<Packet> {
        let payload = self.state.read().codec.encode_reply(message, side, inbound)?;
        Ok(Packet::new(self.name.clone(), payload))
    }

    /// Write one packet leaving from `sending`
    pub(crate) fn write(&self, connection: ConnectionId, packet: Packet, sending: Side) -> ChannelResult<()> {
        self.transport.send(connection, packet)?;
        self.side(sending).stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Reject names a transport could not carry
pub fn validate_channel_name(name: &str) -> ChannelResult<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() > MAX_CHANNEL_NAME_LEN {
        "longer than 20 bytes"
    } else if name.chars().any(char::is_control) {
        "contains control characters"
    } else {
        return Ok(());
    };

    Err(ChannelError::InvalidChannelName {
        name: name.to_string(),
        reason,
    })
}

/// Many message types over one named channel, with one logical channel per side.
///
/// Discriminators are agreed out of band: both endpoints must register the same
/// messages with the same discriminators and sides. Handlers run inline on the
/// transport's inbound thread.
#[derive(Clone)]
pub struct ChannelWrapper {
    shared: Arc<ChannelShared>,
}

impl ChannelWrapper {
    pub fn new(
        name: &str,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn TargetResolver>,
    ) -> ChannelResult<Self> {
        validate_channel_name(name)?;

        Ok(Self {
            shared: Arc::new(ChannelShared {
                name: Arc::from(name),
                state: RwLock::new(ChannelState {
                    codec: IndexedCodec::new(),
                    pipeline: Pipeline::new(),
                }),
                transport,
                resolver,
                sides: Default::default(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Register a message type and its handler.
    ///
    /// `side` is where the message is processed, not where it is sent from. The
    /// discriminator must be unused on this channel; a failed registration leaves
    /// the channel unchanged.
    pub fn register_message<M, H>(
        &self,
        handler: H,
        discriminator: Discriminator,
        side: Side,
    ) -> ChannelResult<Registration>
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let mut state = self.shared.state.write();
        state.codec.add_discriminator::<M>(discriminator, side)?;
        let registration = state.pipeline.install::<M, H>(handler, discriminator, side);

        tracing::debug!(
            "Channel {}: {} bound to discriminator {} on the {} side ({})",
            self.shared.name,
            registration.message_type,
            discriminator,
            side,
            registration.stage
        );

        Ok(registration)
    }

    /// Register a closure as the handler
    pub fn register_fn<M, F>(
        &self,
        func: F,
        discriminator: Discriminator,
        side: Side,
    ) -> ChannelResult<Registration>
    where
        M: Message,
        F: Fn(M, &mut MessageContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_message::<M, _>(FnHandler::new(func), discriminator, side)
    }

    /// Installed stages, newest first
    pub fn registrations(&self) -> Vec<Registration> {
        self.shared.state.read().pipeline.registrations()
    }

    /// Install the owner-thread scheduler offered to handlers running on `side`
    pub fn set_scheduler(&self, side: Side, scheduler: Arc<dyn TaskScheduler>) {
        *self.shared.side(side).scheduler.write() = Some(scheduler);
    }

    pub fn stats(&self, side: Side) -> ChannelStats {
        self.shared.side(side).stats.snapshot()
    }

    /// Encode `message` for clients without sending it, for embedding in other
    /// transport paths
    pub fn get_packet_from<M: Message>(&self, message: &M) -> ChannelResult<Packet> {
        self.shared.encode_for(message, Side::Receiving)
    }

    /// Encode once and write to every connection `target` resolves to.
    ///
    /// The target travels with the call, so concurrent senders never see each
    /// other's addressing. Every connection is attempted; the first failure is
    /// returned afterwards. Returns the number of connections written.
    pub fn send<M: Message>(&self, message: &M, target: Target) -> ChannelResult<usize> {
        let processing = target.processing_side();
        let packet = self.shared.encode_for(message, processing)?;
        let connections = self.shared.resolver.resolve(&target)?;

        let mut delivered = 0;
        let mut first_error = None;
        for connection in connections {
            match self.shared.write(connection, packet.clone(), processing.opposite()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        "Channel {}: send to {} ({}) failed: {}",
                        self.shared.name,
                        connection,
                        target,
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::trace!(
            "Channel {}: {} bytes sent to {} connection(s) ({})",
            self.shared.name,
            packet.len(),
            delivered,
            target
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    /// Send to every client; the handler must be on the receiving side
    pub fn send_to_all<M: Message>(&self, message: &M) -> ChannelResult<usize> {
        self.send(message, Target::All)
    }

    /// Send to one client; the handler must be on the receiving side
    pub fn send_to<M: Message>(&self, message: &M, recipient: EndpointId) -> ChannelResult<usize> {
        self.send(message, Target::Single(recipient))
    }

    /// Send to every client near `point`; the handler must be on the receiving side
    pub fn send_to_all_around<M: Message>(&self, message: &M, point: TargetPoint) -> ChannelResult<usize> {
        self.send(message, Target::AroundPoint(point))
    }

    /// Send to every client in a partition; the handler must be on the receiving side
    pub fn send_to_dimension<M: Message>(&self, message: &M, partition: PartitionId) -> ChannelResult<usize> {
        self.send(message, Target::Partition(partition))
    }

    /// Send to the server; the handler must be on the originating side
    pub fn send_to_server<M: Message>(&self, message: &M) -> ChannelResult<usize> {
        self.send(message, Target::ToOriginatingEndpoint)
    }

    /// Decode one inbound message received on `connection` and dispatch it to the
    /// stage registered for `side`.
    ///
    /// Runs the handler on the calling thread. Decode and handler failures are
    /// returned for the transport's error path; a message no stage accepts is
    /// dropped as [`Outcome::Unhandled`]. A staged reply is written back to
    /// `connection` only.
    pub fn handle_inbound(
        &self,
        side: Side,
        connection: ConnectionId,
        payload: Bytes,
    ) -> ChannelResult<Outcome> {
        let stats = &self.shared.side(side).stats;
        stats.received.fetch_add(1, Ordering::Relaxed);

        let (decoded, stage) = {
            let state = self.shared.state.read();
            let decoded = match state.codec.decode(payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e.into());
                }
            };
            let stage = state
                .pipeline
                .find(decoded.discriminator, side)
                .map(|stage| (stage.registration.clone(), stage.handler.clone()));
            (decoded, stage)
        };

        let Some((registration, handler)) = stage else {
            stats.unhandled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Channel {}: no {} stage for discriminator {} ({}, registered for the {} side) from {}",
                self.shared.name,
                side,
                decoded.discriminator,
                decoded.type_name,
                decoded.side,
                connection
            );
            return Ok(Outcome::Unhandled {
                discriminator: decoded.discriminator,
            });
        };

        tracing::trace!(
            "Channel {}: dispatching {} from {} to {}",
            self.shared.name,
            registration.message_type,
            connection,
            registration.stage
        );

        let mut ctx = MessageContext::new(
            self.shared.clone(),
            side,
            connection,
            registration.discriminator,
        );
        if let Err(source) = handler.invoke(decoded.message, &mut ctx) {
            stats.handler_failures.fetch_add(1, Ordering::Relaxed);
            return Err(ChannelError::HandlerFailure {
                discriminator: registration.discriminator,
                message_type: registration.message_type,
                source,
            });
        }

        match ctx.take_reply() {
            None => Ok(Outcome::Done),
            Some(reply) => {
                let packet = self
                    .shared
                    .encode_reply(reply.as_ref(), side, registration.discriminator)?;
                self.shared.write(connection, packet, side)?;
                Ok(Outcome::ReplySent)
            }
        }
    }
}

impl std::fmt::Debug for ChannelWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWrapper")
            .field("name", &self.shared.name)
            .field("codec", &self.shared.state.read().codec)
            .finish_non_exhaustive()
    }
}
