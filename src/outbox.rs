//! Per-thread message dispatcher.
//!
//! Every producing thread owns exactly one [`Outbox`]: the pump thread's
//! lives in the [`System`](crate::System), each worker thread owns its
//! own. An outbox maps payload types to lanes, where a lane holds the
//! reusable writer cores and the batch pool for that type. Closing a
//! writer pushes one send request per recipient onto the owning thread's
//! send queue, which the pump thread drains and routes.
//!
//! # The active-outbox scope
//!
//! Handlers run deep inside an actor's dispatch loop and have no natural
//! path to the outbox of the thread running them. Before delivering to an
//! actor, the runner enters an outbox scope, publishing its outbox in a
//! thread-local; the scope guard restores the previous value on drop, so
//! nested deliveries form a stack and always see the right outbox on top.
//! [`with_active`] hands the current top to a closure, temporarily taking
//! the slot so a reentrant call cannot alias the exclusive borrow.

use std::any::{Any, TypeId};
use std::cell::Cell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::batch::{BatchHandle, BatchPool, BatchRef};
use crate::chain::ChainSender;
use crate::id::{ActorId, ChannelId};
use crate::system::Shared;
use crate::writer::{Writer, WriterCore};
use crate::Payload;

/// One pending delivery: a batch addressed to a single recipient.
pub(crate) struct SendRequest {
    pub(crate) dest: ActorId,
    pub(crate) batch: BatchRef,
}

/// Per-payload-type state: the writer stack and the batch pool.
struct Lane<T: Payload> {
    writers: Vec<WriterCore<T>>,
    pool: Arc<BatchPool<T>>,
}

/// Typed dispatcher owned by a single producing thread.
pub struct Outbox {
    source: ActorId,
    shared: Arc<Shared>,
    send_tx: ChainSender<SendRequest>,
    lanes: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl Outbox {
    pub(crate) fn new(shared: Arc<Shared>, send_tx: ChainSender<SendRequest>) -> Self {
        Self {
            source: ActorId::UNDEFINED,
            shared,
            send_tx,
            lanes: HashMap::new(),
        }
    }

    /// Stamped as the source of subsequently opened writers. The actor
    /// run loop sets this to the actor being dispatched and clears it
    /// afterwards.
    pub(crate) fn set_source(&mut self, source: ActorId) {
        self.source = source;
    }

    /// Opens a writer for a batch of `T`.
    ///
    /// On a disposed system the returned writer is inert and discards
    /// everything.
    pub fn begin_send<T: Payload>(&mut self) -> Writer<'_, T> {
        if !self.shared.live.load(Ordering::Acquire) {
            tracing::trace!("send after dispose discarded");
            return Writer::new(self, None);
        }
        let source = self.source;
        let mut core = self.lane_mut::<T>().writers.pop().unwrap_or_default();
        core.source = source;
        Writer::new(self, Some(core))
    }

    /// Sends a single message to a single destination.
    pub fn send<T: Payload>(&mut self, dest: impl Into<ActorId>, message: T) {
        let mut writer = self.begin_send::<T>();
        writer.add_recipient(dest);
        writer.add_message(message);
        writer.close();
    }

    /// Sends a batch of messages to a single destination.
    pub fn send_all<T: Payload>(
        &mut self,
        dest: impl Into<ActorId>,
        messages: impl IntoIterator<Item = T>,
    ) {
        let mut writer = self.begin_send::<T>();
        writer.add_recipient(dest);
        for message in messages {
            writer.add_message(message);
        }
        writer.close();
    }

    /// Sends a single message with an explicit source and channel.
    pub fn send_from<T: Payload>(
        &mut self,
        dest: impl Into<ActorId>,
        message: T,
        source: ActorId,
        channel: ChannelId,
    ) {
        let mut writer = self.begin_send::<T>();
        writer.set_source(source);
        writer.set_channel(channel);
        writer.add_recipient(dest);
        writer.add_message(message);
        writer.close();
    }

    /// Dispatches a closed writer: moves its state into a pooled batch and
    /// queues one send request per recipient.
    pub(crate) fn finish_writer<T: Payload>(&mut self, mut core: WriterCore<T>) {
        if core.recipients.is_empty() {
            self.discard_writer(core);
            return;
        }

        let pool = Arc::clone(&self.lane_mut::<T>().pool);
        // SAFETY: This outbox, and therefore every pool hanging off it, is
        // owned by the calling thread, the single consumer of the pool
        // shelves.
        let batch = unsafe {
            pool.acquire(
                core.source,
                core.channel,
                &mut core.recipients,
                &mut core.messages,
            )
        };

        let recipients = batch.recipient_count() as u64;
        self.shared.sent.fetch_add(recipients, Ordering::Relaxed);
        metrics::counter!("skein_messages_sent").increment(recipients);

        for &dest in batch.recipients() {
            let handle: BatchRef = Arc::clone(&batch) as BatchRef;
            self.send_tx.push(SendRequest {
                dest,
                batch: handle,
            });
        }

        core.clear();
        self.lane_mut::<T>().writers.push(core);
    }

    /// Returns a writer core to its lane without dispatching.
    pub(crate) fn discard_writer<T: Payload>(&mut self, mut core: WriterCore<T>) {
        core.clear();
        self.lane_mut::<T>().writers.push(core);
    }

    fn lane_mut<T: Payload>(&mut self) -> &mut Lane<T> {
        let entry = self.lanes.entry(TypeId::of::<T>()).or_insert_with(|| {
            Box::new(Lane::<T> {
                writers: Vec::new(),
                pool: BatchPool::new(),
            })
        });
        entry
            .downcast_mut::<Lane<T>>()
            .expect("lane payload type matches its key")
    }
}

thread_local! {
    /// Top of this thread's active-outbox stack; previous entries live in
    /// the chain of [`OutboxScope`] guards on the call stack.
    static ACTIVE_OUTBOX: Cell<*mut Outbox> = const { Cell::new(ptr::null_mut()) };
}

/// Guard that publishes an outbox as the thread's active one for the
/// duration of a delivery, restoring the previous on drop.
pub(crate) struct OutboxScope {
    prev: *mut Outbox,
}

impl OutboxScope {
    pub(crate) fn enter(outbox: &mut Outbox) -> Self {
        let prev = ACTIVE_OUTBOX.replace(ptr::from_mut(outbox));
        Self { prev }
    }
}

impl Drop for OutboxScope {
    fn drop(&mut self) {
        ACTIVE_OUTBOX.set(self.prev);
    }
}

/// Runs `f` with the outbox of the delivery currently in progress on this
/// thread.
///
/// Returns `None` when no delivery is in progress (or from a reentrant
/// call while the outbox is already borrowed), in which case `f` is not
/// run. Handler code normally reaches this through
/// [`Mail::send`](crate::Mail::send) and
/// [`Mail::respond`](crate::Mail::respond).
pub fn with_active<R>(f: impl FnOnce(&mut Outbox) -> R) -> Option<R> {
    let outbox = ACTIVE_OUTBOX.replace(ptr::null_mut());
    if outbox.is_null() {
        return None;
    }
    // SAFETY: The pointer was published by `OutboxScope::enter` from a
    // live `&mut Outbox` whose scope is still on this thread's call
    // stack; taking it out of the slot above keeps the borrow exclusive
    // even if `f` calls back into `with_active`.
    let result = f(unsafe { &mut *outbox });
    ACTIVE_OUTBOX.set(outbox);
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain;

    fn test_outbox() -> (Outbox, chain::ChainReceiver<SendRequest>) {
        let shared = Arc::new(Shared::new());
        let (send_tx, send_rx) = chain::channel(chain::DEFAULT_CHAIN_CAPACITY);
        (Outbox::new(shared, send_tx), send_rx)
    }

    #[test]
    fn close_queues_one_request_per_recipient_in_order() {
        let (mut outbox, mut send_rx) = test_outbox();
        let mut writer = outbox.begin_send::<i64>();
        writer.set_channel(5);
        writer.add_recipient(1u32);
        writer.add_recipient(2u32);
        writer.add_recipient(3u32);
        writer.add_message(100);
        writer.add_message(101);
        writer.close();

        for expected in 1..=3u32 {
            let request = send_rx.pop().expect("request queued");
            assert_eq!(request.dest, ActorId::from(expected));
            assert_eq!(request.batch.channel(), 5);
            assert_eq!(request.batch.message_count(), 2);
            assert_eq!(request.batch.recipient_count(), 3);
        }
        assert!(send_rx.pop().is_none());
        assert_eq!(outbox.shared.sent.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn zero_recipients_dispatches_nothing() {
        let (mut outbox, mut send_rx) = test_outbox();
        let mut writer = outbox.begin_send::<i64>();
        writer.add_message(7);
        writer.close();

        assert!(send_rx.pop().is_none());
        assert_eq!(outbox.shared.sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn writer_core_is_reused_between_sends() {
        let (mut outbox, mut send_rx) = test_outbox();
        outbox.send(1u32, 10i32);
        outbox.send(1u32, 11i32);

        assert_eq!(outbox.lane_mut::<i32>().writers.len(), 1);
        let first = send_rx.pop().expect("first send");
        let second = send_rx.pop().expect("second send");
        assert_eq!(first.batch.message_count(), 1);
        assert_eq!(second.batch.message_count(), 1);
    }

    #[test]
    fn disposed_system_discards_sends() {
        let (mut outbox, mut send_rx) = test_outbox();
        outbox.shared.live.store(false, Ordering::Release);
        outbox.send(1u32, 42i32);

        assert!(send_rx.pop().is_none());
        assert_eq!(outbox.shared.sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn with_active_targets_the_entered_outbox() {
        let (mut outbox, mut send_rx) = test_outbox();
        assert!(with_active(|_| ()).is_none());
        {
            let _scope = OutboxScope::enter(&mut outbox);
            let ran = with_active(|active| {
                active.send(9u32, 1i32);
                // A reentrant call sees no active outbox while the borrow
                // is out.
                assert!(with_active(|_| ()).is_none());
            });
            assert!(ran.is_some());
            assert!(with_active(|_| ()).is_some());
        }
        assert!(with_active(|_| ()).is_none());
        assert_eq!(send_rx.pop().expect("queued").dest, ActorId::from(9));
    }

    #[test]
    fn source_is_stamped_from_the_outbox() {
        let (mut outbox, mut send_rx) = test_outbox();
        outbox.set_source(ActorId::from(4));
        outbox.send(1u32, 0i32);
        assert_eq!(send_rx.pop().expect("queued").batch.source(), ActorId::from(4));

        outbox.set_source(ActorId::UNDEFINED);
        outbox.send_from(1u32, 0i32, ActorId::from(8), 2);
        let request = send_rx.pop().expect("queued");
        assert_eq!(request.batch.source(), ActorId::from(8));
        assert_eq!(request.batch.channel(), 2);
    }
}
