//! Discriminator codec
//!
//! Maps a one-byte discriminator to the decode function of a message type, and a
//! message type plus processing side back to its discriminator. The discriminator
//! is the only structural envelope; the payload is opaque to the codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use super::{AnyMessage, BoxedMessage, Discriminator, Message, MessageError, Side};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Discriminator {discriminator} is already bound to {existing}")]
    DuplicateDiscriminator {
        discriminator: Discriminator,
        existing: &'static str,
    },

    #[error("No message type bound to discriminator {0}")]
    UnregisteredType(Discriminator),

    #[error("Truncated message: no discriminator byte")]
    TruncatedMessage,

    #[error("Message type {message_type} is not registered for the {side} side")]
    UnregisteredMessage {
        message_type: &'static str,
        side: Side,
    },

    #[error("Malformed payload for discriminator {discriminator}: {source}")]
    Payload {
        discriminator: Discriminator,
        #[source]
        source: MessageError,
    },

    #[error("Encode error: {0}")]
    Message(#[from] MessageError),
}

pub type CodecResult<T> = Result<T, CodecError>;

type DecodeFn = fn(&mut Bytes) -> Result<BoxedMessage, MessageError>;

fn decode_boxed<M: Message>(buf: &mut Bytes) -> Result<BoxedMessage, MessageError> {
    Ok(Box::new(M::decode(buf)?))
}

/// A discriminator's binding
#[derive(Clone, Copy)]
struct Binding {
    type_id: TypeId,
    type_name: &'static str,
    side: Side,
    decode: DecodeFn,
}

/// The result of decoding one inbound message
pub struct Decoded {
    pub discriminator: Discriminator,
    /// Side the message type was registered for
    pub side: Side,
    pub type_name: &'static str,
    pub message: BoxedMessage,
}

impl std::fmt::Debug for Decoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoded")
            .field("discriminator", &self.discriminator)
            .field("side", &self.side)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Discriminator-indexed codec for one channel
#[derive(Default)]
pub struct IndexedCodec {
    bindings: BTreeMap<Discriminator, Binding>,
    discriminators: HashMap<(TypeId, Side), Discriminator>,
}

impl IndexedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `discriminator` to `M`, processed on `side`.
    ///
    /// Fails if the discriminator is already bound; the existing binding is kept.
    pub fn add_discriminator<M: Message>(
        &mut self,
        discriminator: Discriminator,
        side: Side,
    ) -> CodecResult<()> {
        if let Some(existing) = self.bindings.get(&discriminator) {
            return Err(CodecError::DuplicateDiscriminator {
                discriminator,
                existing: existing.type_name,
            });
        }

        let binding = Binding {
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            side,
            decode: decode_boxed::<M>,
        };
        self.bindings.insert(discriminator, binding);

        if let Some(previous) = self.discriminators.insert((binding.type_id, side), discriminator) {
            tracing::warn!(
                "{} re-bound for the {} side: encoding now uses discriminator {} instead of {}",
                binding.type_name,
                side,
                discriminator,
                previous
            );
        }

        Ok(())
    }

    /// Discriminator used when `M` is sent to be processed on `side`
    pub fn discriminator_of<M: Message>(&self, side: Side) -> Option<Discriminator> {
        self.discriminators.get(&(TypeId::of::<M>(), side)).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Encode a message to be processed on `side`: discriminator byte, then payload
    pub fn encode<M: Message>(&self, message: &M, side: Side) -> CodecResult<Bytes> {
        self.encode_any(message, side)
    }

    pub fn encode_any(&self, message: &dyn AnyMessage, side: Side) -> CodecResult<Bytes> {
        let discriminator = self
            .discriminators
            .get(&(message.message_type_id(), side))
            .copied()
            .ok_or(CodecError::UnregisteredMessage {
                message_type: message.message_type_name(),
                side,
            })?;

        self.encode_with(discriminator, message)
    }

    /// Encode a reply to a message that arrived as `inbound` and was processed on
    /// `side`.
    ///
    /// Prefers the reply type's binding for the opposite side. Without one, a reply
    /// of the inbound type reuses `inbound`, and any other type falls back to its
    /// binding for `side`.
    pub fn encode_reply(
        &self,
        message: &dyn AnyMessage,
        side: Side,
        inbound: Discriminator,
    ) -> CodecResult<Bytes> {
        let type_id = message.message_type_id();
        let discriminator = self
            .discriminators
            .get(&(type_id, side.opposite()))
            .copied()
            .or_else(|| {
                self.bindings
                    .get(&inbound)
                    .filter(|binding| binding.type_id == type_id)
                    .map(|_| inbound)
            })
            .or_else(|| self.discriminators.get(&(type_id, side)).copied())
            .ok_or(CodecError::UnregisteredMessage {
                message_type: message.message_type_name(),
                side: side.opposite(),
            })?;

        self.encode_with(discriminator, message)
    }

    fn encode_with(&self, discriminator: Discriminator, message: &dyn AnyMessage) -> CodecResult<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(discriminator);
        message.encode_payload(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one whole message
    pub fn decode(&self, mut bytes: Bytes) -> CodecResult<Decoded> {
        if !bytes.has_remaining() {
            return Err(CodecError::TruncatedMessage);
        }

        let discriminator = bytes.get_u8();
        let binding = self
            .bindings
            .get(&discriminator)
            .ok_or(CodecError::UnregisteredType(discriminator))?;

        let message = (binding.decode)(&mut bytes).map_err(|source| CodecError::Payload {
            discriminator,
            source,
        })?;

        if bytes.has_remaining() {
            tracing::trace!(
                "{} left {} trailing bytes after discriminator {}",
                binding.type_name,
                bytes.remaining(),
                discriminator
            );
        }

        Ok(Decoded {
            discriminator,
            side: binding.side,
            type_name: binding.type_name,
            message,
        })
    }
}

impl std::fmt::Debug for IndexedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (discriminator, binding) in &self.bindings {
            map.entry(discriminator, &(binding.type_name, binding.side));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ensure_remaining, MessageResult};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq)]
    struct Ping {
        counter: i64,
    }

    impl Message for Ping {
        fn encode(&self, buf: &mut BytesMut) -> MessageResult<()> {
            buf.put_i64(self.counter);
            Ok(())
        }

        fn decode(buf: &mut Bytes) -> MessageResult<Self> {
            ensure_remaining(buf, 8)?;
            Ok(Ping {
                counter: buf.get_i64(),
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rename {
        entity: u32,
        name: String,
    }

    crate::bincode_message!(Rename);

    fn decode_as<M: Message + Clone>(decoded: Decoded) -> M {
        decoded
            .message
            .downcast::<M>()
            .map(|m| *m)
            .expect("unexpected message type")
    }

    #[test]
    fn test_encode_layout() {
        let mut codec = IndexedCodec::new();
        codec.add_discriminator::<Ping>(1, Side::Receiving).unwrap();

        let bytes = codec.encode(&Ping { counter: 5 }, Side::Receiving).unwrap();
        assert_eq!(&bytes[..], &[0x01, 0, 0, 0, 0, 0, 0, 0, 0x05]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = IndexedCodec::new();
        codec.add_discriminator::<Ping>(1, Side::Receiving).unwrap();
        codec.add_discriminator::<Rename>(200, Side::Originating).unwrap();

        let ping = Ping { counter: -42 };
        let decoded = codec.decode(codec.encode(&ping, Side::Receiving).unwrap()).unwrap();
        assert_eq!(decoded.discriminator, 1);
        assert_eq!(decoded.side, Side::Receiving);
        assert_eq!(decode_as::<Ping>(decoded), ping);

        let rename = Rename {
            entity: 7,
            name: "lantern".to_string(),
        };
        let decoded = codec.decode(codec.encode(&rename, Side::Originating).unwrap()).unwrap();
        assert_eq!(decoded.discriminator, 200);
        assert_eq!(decode_as::<Rename>(decoded), rename);
    }

    #[test]
    fn test_duplicate_discriminator_keeps_first() {
        let mut codec = IndexedCodec::new();
        codec.add_discriminator::<Ping>(3, Side::Receiving).unwrap();

        let err = codec.add_discriminator::<Rename>(3, Side::Originating).unwrap_err();
        assert!(matches!(
            err,
            CodecError::DuplicateDiscriminator { discriminator: 3, .. }
        ));

        let decoded = codec.decode(codec.encode(&Ping { counter: 9 }, Side::Receiving).unwrap()).unwrap();
        assert_eq!(decoded.side, Side::Receiving);
        assert_eq!(decode_as::<Ping>(decoded).counter, 9);
        assert!(codec.discriminator_of::<Rename>(Side::Originating).is_none());
    }

    #[test]
    fn test_empty_buffer_is_truncated() {
        let codec = IndexedCodec::new();
        assert!(matches!(
            codec.decode(Bytes::new()),
            Err(CodecError::TruncatedMessage)
        ));
    }

    #[test]
    fn test_unbound_discriminator() {
        let mut codec = IndexedCodec::new();
        codec.add_discriminator::<Ping>(1, Side::Receiving).unwrap();
        assert!(matches!(
            codec.decode(Bytes::from_static(&[0x09, 0x00])),
            Err(CodecError::UnregisteredType(9))
        ));
    }

    #[test]
    fn test_malformed_payload_reported_by_type() {
        let mut codec = IndexedCodec::new();
        codec.add_discriminator::<Ping>(1, Side::Receiving).unwrap();
        match codec.decode(Bytes::from_static(&[0x01, 0x00, 0x01])) {
            Err(CodecError::Payload {
                discriminator: 1,
                source: MessageError::Truncated { needed: 8, remaining: 2 },
            }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_same_type_bound_per_side() {
        let mut codec = IndexedCodec::new();
        codec.add_discriminator::<Ping>(1, Side::Receiving).unwrap();
        codec.add_discriminator::<Ping>(2, Side::Originating).unwrap();

        let to_client = codec.encode(&Ping { counter: 1 }, Side::Receiving).unwrap();
        let to_server = codec.encode(&Ping { counter: 1 }, Side::Originating).unwrap();
        assert_eq!(to_client[0], 1);
        assert_eq!(to_server[0], 2);
        assert_eq!(codec.decode(to_server).unwrap().side, Side::Originating);
    }

    #[test]
    fn test_encode_unregistered_side() {
        let mut codec = IndexedCodec::new();
        codec.add_discriminator::<Ping>(1, Side::Receiving).unwrap();
        assert!(matches!(
            codec.encode(&Ping { counter: 1 }, Side::Originating),
            Err(CodecError::UnregisteredMessage { side: Side::Originating, .. })
        ));
    }

    #[test]
    fn test_rebinding_same_side_moves_encoding() {
        let mut codec = IndexedCodec::new();
        codec.add_discriminator::<Ping>(4, Side::Receiving).unwrap();
        codec.add_discriminator::<Ping>(5, Side::Receiving).unwrap();

        assert_eq!(codec.discriminator_of::<Ping>(Side::Receiving), Some(5));
        let bytes = codec.encode(&Ping { counter: 3 }, Side::Receiving).unwrap();
        assert_eq!(bytes[0], 5);

        // the first binding still decodes
        let decoded = codec
            .decode(Bytes::from_static(&[0x04, 0, 0, 0, 0, 0, 0, 0, 0x0B]))
            .unwrap();
        assert_eq!(decoded.discriminator, 4);
        assert_eq!(decoded.side, Side::Receiving);
        assert_eq!(decode_as::<Ping>(decoded).counter, 11);
        assert_eq!(codec.len(), 2);
    }

    #[test]
    fn test_reply_encoding_fallbacks() {
        let mut codec = IndexedCodec::new();
        codec.add_discriminator::<Ping>(1, Side::Receiving).unwrap();
        codec.add_discriminator::<Rename>(9, Side::Receiving).unwrap();

        // only bound for the handler's side: reuse the inbound discriminator
        let reply = codec.encode_reply(&Ping { counter: 6 }, Side::Receiving, 1).unwrap();
        assert_eq!(&reply[..], &[0x01, 0, 0, 0, 0, 0, 0, 0, 0x06]);

        // a different type falls back to its own binding for that side
        let rename = Rename {
            entity: 1,
            name: "x".to_string(),
        };
        assert_eq!(codec.encode_reply(&rename, Side::Receiving, 1).unwrap()[0], 9);

        // an opposite-side binding wins when present
        codec.add_discriminator::<Ping>(2, Side::Originating).unwrap();
        assert_eq!(codec.encode_reply(&Ping { counter: 6 }, Side::Receiving, 1).unwrap()[0], 2);

        let mut server_only = IndexedCodec::new();
        server_only.add_discriminator::<Ping>(2, Side::Originating).unwrap();
        assert!(matches!(
            server_only.encode_reply(&rename, Side::Originating, 2),
            Err(CodecError::UnregisteredMessage { side: Side::Receiving, .. })
        ));
    }
}
