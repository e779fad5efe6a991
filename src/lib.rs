//! chanmux - Typed message multiplexing over named channels
//!
//! Many message types share one named channel; each is tagged with a one-byte
//! discriminator and dispatched to a handler on the side that processes it.

pub mod bounce;
pub mod channel;
pub mod config;
pub mod network;
pub mod protocol;
pub mod transport;

pub use channel::{
    ChannelError, ChannelRegistry, ChannelResult, ChannelWrapper, MessageContext, MessageHandler,
    Outcome, Registration, Replier, TaskQueue, TaskScheduler,
};
pub use protocol::{Discriminator, Message, MessageError, Side};
pub use transport::{ConnectionId, EndpointId, PartitionId, Target, TargetPoint};

#[doc(hidden)]
pub mod __private {
    pub use bincode;
    pub use bytes;
}
