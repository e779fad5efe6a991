//! Bounce demo
//!
//! A single `Ping` type registered twice on one channel: discriminator 1 is processed
//! by clients, discriminator 2 by the server. Each side answers with the tick count
//! plus one, so a ping started by either side travels back and forth indefinitely.
//! Every twentieth tick the answer is deferred to the owner thread's task queue.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::{ChannelResult, ChannelWrapper, MessageContext, MessageHandler};
use crate::protocol::{ensure_remaining, Discriminator, Message, MessageResult, Side};

/// Processed on the receiving (client) side
pub const PING_TO_CLIENT: Discriminator = 1;
/// Processed on the originating (server) side
pub const PING_TO_SERVER: Discriminator = 2;

/// Replies to ticks that are multiples of this go through the task queue
pub const DEFER_EVERY: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub ticks: i64,
}

impl Message for Ping {
    fn encode(&self, buf: &mut BytesMut) -> MessageResult<()> {
        buf.put_i64(self.ticks);
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> MessageResult<Self> {
        ensure_remaining(buf, 8)?;
        Ok(Ping {
            ticks: buf.get_i64(),
        })
    }
}

/// Counters shared by both of a channel's bounce handlers
#[derive(Debug, Default)]
pub struct BounceTracker {
    handled: AtomicU64,
    deferred: AtomicU64,
    highest: AtomicI64,
}

impl BounceTracker {
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Replies sent from the task queue rather than inline
    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    /// Largest tick count seen so far
    pub fn highest(&self) -> i64 {
        self.highest.load(Ordering::Relaxed)
    }

    fn observe(&self, ticks: i64) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.highest.fetch_max(ticks, Ordering::Relaxed);
    }
}

struct BounceHandler {
    rounds: Option<i64>,
    tracker: Arc<BounceTracker>,
}

impl MessageHandler<Ping> for BounceHandler {
    fn on_message(&self, ping: Ping, ctx: &mut MessageContext) -> anyhow::Result<()> {
        self.tracker.observe(ping.ticks);
        tracing::info!(
            "{} side got ping {} from {}",
            ctx.side(),
            ping.ticks,
            ctx.connection()
        );

        if self.rounds.is_some_and(|rounds| ping.ticks >= rounds) {
            tracing::info!("Bounce finished after {} ticks", ping.ticks);
            return Ok(());
        }

        let next = Ping {
            ticks: ping.ticks + 1,
        };

        if ping.ticks % DEFER_EVERY == 0 {
            let replier = ctx.replier();
            let tracker = self.tracker.clone();
            ctx.schedule(move || match replier.reply(next) {
                Ok(()) => {
                    tracker.deferred.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::warn!("Deferred ping {} failed: {}", next.ticks, e),
            })?;
        } else {
            ctx.reply(next);
        }

        Ok(())
    }
}

/// Register both bounce handlers on `channel`.
///
/// With `rounds`, a ping carrying that many ticks is not answered.
pub fn register(channel: &ChannelWrapper, rounds: Option<i64>) -> ChannelResult<Arc<BounceTracker>> {
    let tracker = Arc::new(BounceTracker::default());
    let handler = Arc::new(BounceHandler {
        rounds,
        tracker: tracker.clone(),
    });

    channel.register_message::<Ping, _>(handler.clone(), PING_TO_CLIENT, Side::Receiving)?;
    channel.register_message::<Ping, _>(handler, PING_TO_SERVER, Side::Originating)?;

    Ok(tracker)
}
