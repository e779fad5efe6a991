//! Channel registry
//!
//! The channel name is the multiplexing namespace. A registry owns every channel
//! sharing one transport and routes inbound packets to them by name.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ChannelError, ChannelResult, ChannelWrapper, Outcome, Registration};
use crate::protocol::Side;
use crate::transport::{ConnectionId, Packet, TargetResolver, Transport};

/// Named channels over one transport
pub struct ChannelRegistry {
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn TargetResolver>,
    channels: RwLock<BTreeMap<String, ChannelWrapper>>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn Transport>, resolver: Arc<dyn TargetResolver>) -> Self {
        Self {
            transport,
            resolver,
            channels: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a channel; each name can be created once
    pub fn new_channel(&self, name: &str) -> ChannelResult<ChannelWrapper> {
        let mut channels = self.channels.write();
        if channels.contains_key(name) {
            return Err(ChannelError::DuplicateChannel(name.to_string()));
        }

        let channel = ChannelWrapper::new(name, self.transport.clone(), self.resolver.clone())?;
        channels.insert(name.to_string(), channel.clone());
        tracing::info!("Channel {} created", name);
        Ok(channel)
    }

    pub fn channel(&self, name: &str) -> Option<ChannelWrapper> {
        self.channels.read().get(name).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    /// Every channel's installed stages, by channel name
    pub fn registrations(&self) -> BTreeMap<String, Vec<Registration>> {
        self.channels
            .read()
            .iter()
            .map(|(name, channel)| (name.clone(), channel.registrations()))
            .collect()
    }

    /// Route an inbound packet to its channel and dispatch it for `side`
    pub fn dispatch(&self, side: Side, connection: ConnectionId, packet: Packet) -> ChannelResult<Outcome> {
        let channel = self
            .channel(&packet.channel)
            .ok_or_else(|| ChannelError::UnknownChannel(packet.channel.to_string()))?;
        channel.handle_inbound(side, connection, packet.payload)
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channel_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageContext;
    use crate::transport::{MemoryTransport, PeerTable};
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    crate::bincode_message!(Note);

    fn registry() -> (ChannelRegistry, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::with_connections([ConnectionId(1)]));
        let registry = ChannelRegistry::new(transport.clone(), Arc::new(PeerTable::new()));
        (registry, transport)
    }

    #[test]
    fn test_duplicate_channel() {
        let (registry, _) = registry();
        registry.new_channel("alpha").unwrap();
        assert!(matches!(
            registry.new_channel("alpha"),
            Err(ChannelError::DuplicateChannel(_))
        ));
        assert!(matches!(
            registry.new_channel(""),
            Err(ChannelError::InvalidChannelName { .. })
        ));
        assert_eq!(registry.channel_names(), vec!["alpha".to_string()]);
    }

    #[test]
    fn test_discriminators_are_scoped_per_channel() {
        let (registry, transport) = registry();
        let alpha = registry.new_channel("alpha").unwrap();
        let beta = registry.new_channel("beta").unwrap();

        alpha
            .register_fn(
                |note: Note, ctx: &mut MessageContext| {
                    ctx.reply(Note {
                        text: format!("alpha saw {}", note.text),
                    });
                    Ok(())
                },
                1,
                Side::Originating,
            )
            .unwrap();
        alpha
            .register_fn(|_: Note, _: &mut MessageContext| Ok(()), 2, Side::Receiving)
            .unwrap();
        beta
            .register_fn(|_: Note, _: &mut MessageContext| Ok(()), 1, Side::Originating)
            .unwrap();

        let packet = alpha.get_packet_from(&Note { text: "x".into() }).unwrap();
        assert_eq!(packet.payload[0], 2);

        let request = Packet::new(
            "alpha",
            Bytes::from([&[1u8][..], &bincode::serialize(&Note { text: "hi".into() }).unwrap()[..]].concat()),
        );
        assert_eq!(
            registry.dispatch(Side::Originating, ConnectionId(1), request).unwrap(),
            Outcome::ReplySent
        );

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&*sent[0].1.channel, "alpha");
        assert_eq!(sent[0].1.payload[0], 2);
    }

    #[test]
    fn test_unknown_channel() {
        let (registry, _) = registry();
        let err = registry
            .dispatch(Side::Receiving, ConnectionId(1), Packet::new("ghost", Bytes::from_static(&[0])))
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownChannel(ref name) if name == "ghost"));
        assert!(err.is_decode_failure());
    }
}
