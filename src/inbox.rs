//! Type-indexed handler table and the inbound mail envelope.
//!
//! Each actor owns one [`Inbox`]: a map from payload `TypeId` to the
//! handlers registered for it. Registering a second handler for the same
//! type chains it after the existing ones; delivery invokes the chain in
//! registration order. A batch whose payload type has no handler is
//! dropped silently (its completion still flows, so the pending counters
//! stay balanced).

use std::any::TypeId;
use std::collections::HashMap;

use crate::batch::{Batch, BatchHandle};
use crate::id::{ActorId, ChannelId};
use crate::outbox;
use crate::Payload;

/// One delivered batch, as observed by a handler.
///
/// `messages` is the whole batch slice in producer insertion order.
/// Handlers receive the envelope by value per invocation; the payload
/// itself is shared and must not be mutated (the slice enforces this).
pub struct Mail<'a, T> {
    /// Actor the batch was attributed to when the writer closed.
    pub source: ActorId,
    /// Actor this delivery targeted (after redirects).
    pub destination: ActorId,
    /// Application-defined channel the batch travelled on.
    pub channel: ChannelId,
    /// The batch's messages, in insertion order.
    pub messages: &'a [T],
}

impl<T: Payload> Mail<'_, T> {
    /// Sends `message` back to this mail's source, on the same channel,
    /// attributed to the actor currently being dispatched.
    ///
    /// Outside a delivery (no active outbox) this is a silent no-op.
    pub fn respond<U: Payload>(&self, message: U) {
        let _ = outbox::with_active(|active| {
            let mut writer = active.begin_send::<U>();
            writer.set_channel(self.channel);
            writer.add_recipient(self.source);
            writer.add_message(message);
            writer.close();
        });
    }

    /// Sends `message` to `dest` through the outbox of the delivery
    /// currently in progress.
    ///
    /// Outside a delivery (no active outbox) this is a silent no-op.
    pub fn send<U: Payload>(&self, dest: impl Into<ActorId>, message: U) {
        let _ = outbox::with_active(|active| active.send(dest, message));
    }
}

type BoxedHandler = Box<dyn FnMut(ActorId, &dyn BatchHandle) + Send>;

/// Handler table consumed by an actor's dispatch loop.
#[derive(Default)]
pub struct Inbox {
    handlers: HashMap<TypeId, Vec<BoxedHandler>>,
}

impl Inbox {
    /// Registers `handler` for every inbound batch of `T`, chained after
    /// any handlers already registered for `T`.
    pub fn on_all<T: Payload>(&mut self, mut handler: impl FnMut(Mail<'_, T>) + Send + 'static) {
        let erased: BoxedHandler = Box::new(move |destination, batch| {
            let Some(batch) = batch.as_any().downcast_ref::<Batch<T>>() else {
                return;
            };
            handler(Mail {
                source: batch.source(),
                destination,
                channel: batch.channel(),
                messages: batch.messages(),
            });
        });
        self.handlers.entry(TypeId::of::<T>()).or_default().push(erased);
    }

    /// Dispatches one delivered batch through the handler chain for its
    /// payload type; unknown types drop silently.
    pub(crate) fn receive(&mut self, destination: ActorId, batch: &dyn BatchHandle) {
        let Some(chain) = self.handlers.get_mut(&batch.payload_type()) else {
            return;
        };
        for handler in chain {
            handler(destination, batch);
        }
    }
}
