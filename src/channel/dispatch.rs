//! Handler registry and dispatch pipeline
//!
//! Each registration installs one dispatch stage scoped to a single
//! `(discriminator, side)` pair, directly after the codec stage.

use serde::Serialize;
use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::MessageContext;
use crate::protocol::{BoxedMessage, Discriminator, Message, Side};

/// Handles one message type on one side
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// Called on the transport's inbound thread.
    ///
    /// Work on state owned by another thread must go through
    /// [`MessageContext::schedule`].
    fn on_message(&self, message: M, ctx: &mut MessageContext) -> anyhow::Result<()>;
}

impl<M: Message, H: MessageHandler<M>> MessageHandler<M> for Arc<H> {
    fn on_message(&self, message: M, ctx: &mut MessageContext) -> anyhow::Result<()> {
        (**self).on_message(message, ctx)
    }
}

/// Adapts a closure to [`MessageHandler`]
pub struct FnHandler<M, F> {
    func: F,
    _phantom: PhantomData<fn(M)>,
}

impl<M, F> FnHandler<M, F>
where
    M: Message,
    F: Fn(M, &mut MessageContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<M, F> MessageHandler<M> for FnHandler<M, F>
where
    M: Message,
    F: Fn(M, &mut MessageContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_message(&self, message: M, ctx: &mut MessageContext) -> anyhow::Result<()> {
        (self.func)(message, ctx)
    }
}

/// Type-erased handler held by a stage
pub(crate) trait ErasedHandler: Send + Sync {
    fn invoke(&self, message: BoxedMessage, ctx: &mut MessageContext) -> anyhow::Result<()>;
}

struct TypedStage<M, H> {
    handler: H,
    _phantom: PhantomData<fn(M)>,
}

impl<M: Message, H: MessageHandler<M>> ErasedHandler for TypedStage<M, H> {
    fn invoke(&self, message: BoxedMessage, ctx: &mut MessageContext) -> anyhow::Result<()> {
        let message = message.downcast::<M>().map_err(|_| {
            anyhow::anyhow!("stage for {} received another message type", type_name::<M>())
        })?;
        self.handler.on_message(*message, ctx)
    }
}

/// Sequential identifier of a dispatch stage, unique within a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// Handle returned by a registration, for introspection and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub stage: StageId,
    pub discriminator: Discriminator,
    pub side: Side,
    pub message_type: &'static str,
}

pub(crate) struct DispatchStage {
    pub registration: Registration,
    pub handler: Arc<dyn ErasedHandler>,
}

/// Ordered dispatch stages of one channel; index 0 sits right after the codec
#[derive(Default)]
pub(crate) struct Pipeline {
    next_id: u32,
    stages: Vec<DispatchStage>,
    index: HashMap<(Discriminator, Side), StageId>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a stage directly after the codec
    pub fn install<M, H>(&mut self, handler: H, discriminator: Discriminator, side: Side) -> Registration
    where
        M: Message,
        H: MessageHandler<M>,
    {
        let stage = StageId(self.next_id);
        self.next_id += 1;

        let registration = Registration {
            stage,
            discriminator,
            side,
            message_type: type_name::<M>(),
        };
        let handler: Arc<dyn ErasedHandler> = Arc::new(TypedStage {
            handler,
            _phantom: PhantomData::<fn(M)>,
        });

        self.stages.insert(
            0,
            DispatchStage {
                registration: registration.clone(),
                handler,
            },
        );
        self.index.insert((discriminator, side), stage);
        registration
    }

    /// The stage that accepts `discriminator` when processing `side`
    pub fn find(&self, discriminator: Discriminator, side: Side) -> Option<&DispatchStage> {
        let stage = self.index.get(&(discriminator, side))?;
        self.stages.iter().find(|s| s.registration.stage == *stage)
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.stages.iter().map(|s| s.registration.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};

    struct Marker;

    impl Message for Marker {
        fn encode(&self, _buf: &mut BytesMut) -> crate::protocol::MessageResult<()> {
            Ok(())
        }

        fn decode(_buf: &mut Bytes) -> crate::protocol::MessageResult<Self> {
            Ok(Marker)
        }
    }

    fn noop() -> FnHandler<
        Marker,
        impl Fn(Marker, &mut MessageContext) -> anyhow::Result<()> + Send + Sync + 'static,
    > {
        FnHandler::new(|_: Marker, _: &mut MessageContext| Ok(()))
    }

    #[test]
    fn test_stage_ids_are_sequential() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.install::<Marker, _>(noop(), 1, Side::Receiving);
        let b = pipeline.install::<Marker, _>(noop(), 2, Side::Originating);
        assert_eq!(a.stage, StageId(0));
        assert_eq!(b.stage, StageId(1));
    }

    #[test]
    fn test_newest_stage_follows_codec() {
        let mut pipeline = Pipeline::new();
        pipeline.install::<Marker, _>(noop(), 1, Side::Receiving);
        pipeline.install::<Marker, _>(noop(), 2, Side::Receiving);

        let order: Vec<Discriminator> = pipeline
            .registrations()
            .iter()
            .map(|r| r.discriminator)
            .collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn test_find_is_scoped_to_side() {
        let mut pipeline = Pipeline::new();
        pipeline.install::<Marker, _>(noop(), 4, Side::Receiving);

        assert!(pipeline.find(4, Side::Receiving).is_some());
        assert!(pipeline.find(4, Side::Originating).is_none());
        assert!(pipeline.find(5, Side::Receiving).is_none());
        assert_eq!(pipeline.len(), 1);
    }
}
