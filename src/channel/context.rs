//! Per-invocation handler context
//!
//! Carries the processing side, the connection the message arrived on, and at most
//! one staged reply.

use std::sync::Arc;

use super::{ChannelError, ChannelResult, ChannelShared, TaskScheduler};
use crate::protocol::{AnyMessage, Discriminator, Message, Side};
use crate::transport::{ConnectionId, EndpointId};

/// Context handed to a handler for one inbound message.
///
/// [`reply`](Self::reply) stages a message; it is encoded and written back to the
/// originating connection after the handler returns. Calling it again replaces the
/// staged message: only the last reply is sent.
///
/// The reply uses the type's binding for the opposite side when there is one.
/// Otherwise a reply of the inbound type goes back under the inbound discriminator,
/// and any other type under its binding for this side.
pub struct MessageContext {
    shared: Arc<ChannelShared>,
    side: Side,
    connection: ConnectionId,
    discriminator: Discriminator,
    reply: Option<Box<dyn AnyMessage>>,
}

impl MessageContext {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        side: Side,
        connection: ConnectionId,
        discriminator: Discriminator,
    ) -> Self {
        Self {
            shared,
            side,
            connection,
            discriminator,
            reply: None,
        }
    }

    /// Side this handler is processing
    pub fn side(&self) -> Side {
        self.side
    }

    /// Connection the message arrived on
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Endpoint behind the originating connection, if the transport knows it
    pub fn sender(&self) -> Option<EndpointId> {
        self.shared.endpoint_of(self.connection)
    }

    pub fn channel(&self) -> &str {
        self.shared.name()
    }

    /// Stage a reply to the originating connection, replacing any earlier one
    pub fn reply<R: Message>(&mut self, message: R) {
        if let Some(previous) = self.reply.replace(Box::new(message)) {
            tracing::trace!(
                "Channel {}: staged reply {} replaced",
                self.shared.name(),
                previous.message_type_name()
            );
        }
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub(crate) fn take_reply(&mut self) -> Option<Box<dyn AnyMessage>> {
        self.reply.take()
    }

    /// A handle that can answer the originating connection after this handler has
    /// returned, from any thread
    pub fn replier(&self) -> Replier {
        Replier {
            shared: self.shared.clone(),
            side: self.side,
            connection: self.connection,
            discriminator: self.discriminator,
        }
    }

    /// The owner-thread scheduler installed for this side
    pub fn scheduler(&self) -> Option<Arc<dyn TaskScheduler>> {
        self.shared.scheduler(self.side)
    }

    /// Queue `task` onto the owner thread of this side
    pub fn schedule<F>(&self, task: F) -> ChannelResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let scheduler = self
            .scheduler()
            .ok_or(ChannelError::NoScheduler(self.side))?;
        scheduler.schedule(Box::new(task))?;
        Ok(())
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("channel", &self.shared.name())
            .field("side", &self.side)
            .field("connection", &self.connection)
            .field("has_reply", &self.reply.is_some())
            .finish()
    }
}

/// Deferred reply to the connection a message arrived on.
///
/// Unlike [`MessageContext::reply`], this writes immediately. The discriminator is
/// chosen the same way as for a staged reply.
#[derive(Clone)]
pub struct Replier {
    shared: Arc<ChannelShared>,
    side: Side,
    connection: ConnectionId,
    discriminator: Discriminator,
}

impl Replier {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn reply<R: Message>(&self, message: R) -> ChannelResult<()> {
        let packet = self
            .shared
            .encode_reply(&message, self.side, self.discriminator)?;
        self.shared.write(self.connection, packet, self.side)
    }
}

impl std::fmt::Debug for Replier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replier")
            .field("channel", &self.shared.name())
            .field("side", &self.side)
            .field("connection", &self.connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::{ChannelError, ChannelWrapper, MessageContext, Outcome, TaskQueue};
    use crate::protocol::{ensure_remaining, Message, MessageResult, Side};
    use crate::transport::{ConnectionId, EndpointId, MemoryTransport, PartitionId, PeerInfo, PeerTable};
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Ticks(i64);

    impl Message for Ticks {
        fn encode(&self, buf: &mut BytesMut) -> MessageResult<()> {
            buf.put_i64(self.0);
            Ok(())
        }

        fn decode(buf: &mut Bytes) -> MessageResult<Self> {
            ensure_remaining(buf, 8)?;
            Ok(Ticks(buf.get_i64()))
        }
    }

    fn setup() -> (ChannelWrapper, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::with_connections([ConnectionId(4)]));
        let peers = Arc::new(PeerTable::new());
        peers.insert(ConnectionId(4), PeerInfo::new(EndpointId(44), PartitionId(0)));
        let channel = ChannelWrapper::new("ctx", transport.clone(), peers).unwrap();
        (channel, transport)
    }

    fn inbound(discriminator: u8, ticks: i64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(discriminator);
        buf.put_i64(ticks);
        buf.freeze()
    }

    #[test]
    fn test_context_identifies_sender() {
        let (channel, _) = setup();
        let seen = Arc::new(Mutex::new(None));
        let record = seen.clone();
        channel
            .register_fn(
                move |_: Ticks, ctx: &mut MessageContext| {
                    *record.lock() = Some((ctx.channel().to_string(), ctx.connection(), ctx.sender()));
                    Ok(())
                },
                2,
                Side::Originating,
            )
            .unwrap();

        channel
            .handle_inbound(Side::Originating, ConnectionId(4), inbound(2, 0))
            .unwrap();
        assert_eq!(
            seen.lock().clone(),
            Some(("ctx".to_string(), ConnectionId(4), Some(EndpointId(44))))
        );
    }

    #[test]
    fn test_deferred_reply_from_owner_thread() {
        let (channel, transport) = setup();
        let mut queue = TaskQueue::new();
        channel.set_scheduler(Side::Originating, Arc::new(queue.scheduler()));
        channel
            .register_fn(|_: Ticks, _: &mut MessageContext| Ok(()), 1, Side::Receiving)
            .unwrap();
        channel
            .register_fn(
                |ticks: Ticks, ctx: &mut MessageContext| {
                    let replier = ctx.replier();
                    ctx.schedule(move || {
                        replier.reply(Ticks(ticks.0 + 1)).unwrap();
                    })?;
                    Ok(())
                },
                2,
                Side::Originating,
            )
            .unwrap();

        let outcome = channel
            .handle_inbound(Side::Originating, ConnectionId(4), inbound(2, 20))
            .unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(transport.sent_count(), 0);

        assert_eq!(queue.run_pending(), 1);
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ConnectionId(4));
        assert_eq!(&sent[0].1.payload[..], &inbound(1, 21)[..]);
    }

    #[test]
    fn test_deferred_reply_reuses_single_binding() {
        let (channel, transport) = setup();
        let mut queue = TaskQueue::new();
        channel.set_scheduler(Side::Receiving, Arc::new(queue.scheduler()));
        channel
            .register_fn(
                |ticks: Ticks, ctx: &mut MessageContext| {
                    let replier = ctx.replier();
                    ctx.schedule(move || {
                        replier.reply(Ticks(ticks.0 + 1)).unwrap();
                    })?;
                    Ok(())
                },
                3,
                Side::Receiving,
            )
            .unwrap();

        channel
            .handle_inbound(Side::Receiving, ConnectionId(4), inbound(3, 40))
            .unwrap();
        assert_eq!(queue.run_pending(), 1);

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].1.payload[..], &inbound(3, 41)[..]);
    }

    #[test]
    fn test_schedule_without_scheduler() {
        let (channel, _) = setup();
        channel
            .register_fn(
                |_: Ticks, ctx: &mut MessageContext| {
                    ctx.schedule(|| {})?;
                    Ok(())
                },
                1,
                Side::Receiving,
            )
            .unwrap();

        let err = channel
            .handle_inbound(Side::Receiving, ConnectionId(4), inbound(1, 0))
            .unwrap_err();
        match err {
            ChannelError::HandlerFailure { source, .. } => {
                assert!(matches!(
                    source.downcast_ref::<ChannelError>(),
                    Some(ChannelError::NoScheduler(Side::Receiving))
                ));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
