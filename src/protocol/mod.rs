//! Protocol module - Message contract and discriminator codec
//!
//! Every message travelling on a channel uses the same minimal envelope:
//! - 1 byte discriminator
//! - Variable length, type-specific payload
//!
//! There is no length prefix; the transport delivers exactly one message per decode.

mod codec;
mod message;

pub use codec::*;
pub use message::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for the reference TCP transport
pub const DEFAULT_PORT: u16 = 24810;

/// Magic bytes for transport frame identification
pub const MAGIC_BYTES: [u8; 4] = [0x43, 0x4D, 0x55, 0x58]; // "CMUX"

/// Longest channel name accepted by a registry
pub const MAX_CHANNEL_NAME_LEN: usize = 20;

/// One-byte tag identifying a message type within a channel
pub type Discriminator = u8;

/// Where the processing (handler execution) of a message happens.
///
/// This is independent of which endpoint physically sent the message: a message
/// registered for [`Side::Receiving`] is handled by whichever endpoint processes the
/// receiving side, i.e. the clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// The originating endpoint (server)
    Originating,
    /// The receiving endpoint (client)
    Receiving,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Originating, Side::Receiving];

    /// The side that processes messages sent from this side
    pub fn opposite(self) -> Self {
        match self {
            Side::Originating => Side::Receiving,
            Side::Receiving => Side::Originating,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Side::Originating => 0,
            Side::Receiving => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Originating => f.write_str("originating"),
            Side::Receiving => f.write_str("receiving"),
        }
    }
}
