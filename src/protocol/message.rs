//! Message contract
//!
//! A message type knows how to write itself into a byte buffer and how to rebuild
//! itself from one. It knows nothing about channels, discriminators or connections.

use bytes::{Buf, Bytes, BytesMut};
use std::any::{Any, TypeId};
use thiserror::Error;

/// Errors raised by a message type's own encoding
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Invalid payload: {0}")]
    Invalid(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type MessageResult<T> = Result<T, MessageError>;

/// A strongly-typed message that can share a channel with other message types.
///
/// `decode(encode(m))` must reproduce `m` exactly.
pub trait Message: Send + Sync + 'static {
    /// Write the payload into the buffer
    fn encode(&self, buf: &mut BytesMut) -> MessageResult<()>;

    /// Rebuild the message from the payload
    fn decode(buf: &mut Bytes) -> MessageResult<Self>
    where
        Self: Sized;
}

/// Fail with [`MessageError::Truncated`] unless `needed` bytes remain.
///
/// `Buf::get_*` panics on short buffers, so hand-written decoders call this first.
pub fn ensure_remaining(buf: &impl Buf, needed: usize) -> MessageResult<()> {
    let remaining = buf.remaining();
    if remaining < needed {
        return Err(MessageError::Truncated { needed, remaining });
    }
    Ok(())
}

/// Object-safe view of a [`Message`], used where the concrete type is erased
/// (staged replies).
pub trait AnyMessage: Send + Sync {
    fn message_type_id(&self) -> TypeId;
    fn message_type_name(&self) -> &'static str;
    fn encode_payload(&self, buf: &mut BytesMut) -> MessageResult<()>;
}

impl<M: Message> AnyMessage for M {
    fn message_type_id(&self) -> TypeId {
        TypeId::of::<M>()
    }

    fn message_type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> MessageResult<()> {
        self.encode(buf)
    }
}

/// A decoded message whose concrete type is only known to its dispatch stage
pub type BoxedMessage = Box<dyn Any + Send>;

/// Implement [`Message`] for serde types by bincode-encoding the whole value.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Chat { text: String }
/// chanmux::bincode_message!(Chat);
/// ```
#[macro_export]
macro_rules! bincode_message {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::protocol::Message for $ty {
                fn encode(
                    &self,
                    buf: &mut $crate::__private::bytes::BytesMut,
                ) -> $crate::protocol::MessageResult<()> {
                    use $crate::__private::bytes::BufMut;
                    let payload = $crate::__private::bincode::serialize(self)?;
                    buf.put_slice(&payload);
                    Ok(())
                }

                fn decode(
                    buf: &mut $crate::__private::bytes::Bytes,
                ) -> $crate::protocol::MessageResult<Self> {
                    use $crate::__private::bytes::Buf;
                    let value = $crate::__private::bincode::deserialize(buf.chunk())?;
                    buf.advance(buf.remaining());
                    Ok(value)
                }
            }
        )+
    };
}
