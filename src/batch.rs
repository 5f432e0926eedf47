//! Pooled, reference-counted message batches.
//!
//! A [`Batch`] is the unit of transfer between producers and actors: one
//! payload type, one source, one channel, an ordered recipient list and an
//! ordered message list. Batches are immutable from the moment the writer
//! closes until the last recipient delivery completes, then return to
//! their pool.
//!
//! Pools are keyed by payload type (one [`BatchPool`] per outbox lane) and
//! by capacity class, `ceil(log2(message_count))`. Each class is backed by
//! its own SPSC [`Chain`] shelf: the pump thread pushes released batches,
//! the owning outbox thread pops them on acquire. Steady-state traffic
//! therefore recycles both the batch allocation and its vectors without
//! touching the allocator.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::chain::Chain;
use crate::id::{ActorId, ChannelId};

/// Marker for types that can travel as message payloads.
///
/// Blanket-implemented: any `Send + Sync + 'static` type qualifies. The
/// runtime never clones or inspects payloads; handlers observe them by
/// shared slice.
pub trait Payload: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Payload for T {}

/// Number of pooled capacity classes (`2^0` through `2^32` messages).
/// Larger batches are allocated fresh and never recycled.
const POOL_CLASSES: usize = 33;

/// Capacity class for a batch of `len` messages: `ceil(log2(max(len, 1)))`.
pub(crate) fn capacity_class(len: usize) -> usize {
    if len <= 1 {
        0
    } else {
        (usize::BITS - (len - 1).leading_zeros()) as usize
    }
}

/// Type-erased view of a batch, shared through every queue of the
/// delivery pipeline.
pub(crate) trait BatchHandle: Send + Sync {
    /// Payload type identity; partitions handler tables and pools.
    fn payload_type(&self) -> TypeId;
    /// Payload type name, for diagnostics.
    fn payload_type_name(&self) -> &'static str;
    /// Producer-stamped source actor.
    fn source(&self) -> ActorId;
    /// Producer-stamped channel.
    fn channel(&self) -> ChannelId;
    /// Number of messages in the batch.
    fn message_count(&self) -> usize;
    /// Number of recipients the batch was dispatched to.
    fn recipient_count(&self) -> usize;
    /// Downcast hook used by the handler table.
    fn as_any(&self) -> &dyn Any;
    /// Records one completed delivery; the batch returns to its pool when
    /// every recipient has been delivered.
    ///
    /// # Safety
    ///
    /// Must be called exactly once per `(batch, recipient)` pair, and only
    /// from the pump thread (the single producer of the pool shelves).
    unsafe fn release(self: Arc<Self>);
}

pub(crate) type BatchRef = Arc<dyn BatchHandle>;

/// A pooled batch of messages of type `T`.
pub(crate) struct Batch<T> {
    source: ActorId,
    channel: ChannelId,
    recipients: Vec<ActorId>,
    messages: Vec<T>,
    delivered: AtomicUsize,
    class: usize,
    pool: Weak<BatchPool<T>>,
}

impl<T: Payload> Batch<T> {
    fn with_class(class: usize, pool: Weak<BatchPool<T>>) -> Self {
        Self {
            source: ActorId::UNDEFINED,
            channel: 0,
            recipients: Vec::new(),
            messages: Vec::new(),
            delivered: AtomicUsize::new(0),
            class,
            pool,
        }
    }

    pub(crate) fn messages(&self) -> &[T] {
        &self.messages
    }

    pub(crate) fn recipients(&self) -> &[ActorId] {
        &self.recipients
    }
}

impl<T: Payload> BatchHandle for Batch<T> {
    fn payload_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn payload_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn source(&self) -> ActorId {
        self.source
    }

    fn channel(&self) -> ChannelId {
        self.channel
    }

    fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    unsafe fn release(self: Arc<Self>) {
        let delivered = self.delivered.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(delivered <= self.recipients.len());
        if delivered < self.recipients.len() {
            return;
        }

        // Final delivery: recycle the batch. Every queued reference has
        // been consumed by now, so this is normally the last one.
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut batch = self;
        if let Some(inner) = Arc::get_mut(&mut batch) {
            inner.recipients.clear();
            inner.messages.clear();
            // SAFETY: The caller is the pump thread, the single producer
            // of every pool shelf.
            unsafe { pool.recycle(batch) };
        }
        // A batch that is still referenced elsewhere is dropped instead of
        // recycled; the pool allocates a replacement on demand.
    }
}

/// Per-payload-type pool of reusable batches, one SPSC shelf per capacity
/// class.
pub(crate) struct BatchPool<T> {
    shelves: Vec<Chain<Arc<Batch<T>>>>,
}

impl<T: Payload> BatchPool<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            shelves: (0..POOL_CLASSES).map(|_| Chain::new(8)).collect(),
        })
    }

    /// Acquires a batch for the accumulated writer state, moving the
    /// recipient and message vectors in (the previous, emptied vectors are
    /// swapped back out to the caller for reuse).
    ///
    /// # Safety
    ///
    /// Must be called from the thread owning the producing outbox (the
    /// single consumer of the pool shelves).
    pub(crate) unsafe fn acquire(
        self: &Arc<Self>,
        source: ActorId,
        channel: ChannelId,
        recipients: &mut Vec<ActorId>,
        messages: &mut Vec<T>,
    ) -> Arc<Batch<T>> {
        let class = capacity_class(messages.len());
        // SAFETY: Per the caller's contract this thread is the single
        // consumer of the shelves.
        let pooled = unsafe { self.take_pooled(class) };
        let mut batch =
            pooled.unwrap_or_else(|| Arc::new(Batch::with_class(class, Arc::downgrade(self))));

        let inner = Arc::get_mut(&mut batch).expect("pooled batch is uniquely owned");
        inner.source = source;
        inner.channel = channel;
        inner.delivered.store(0, Ordering::Relaxed);
        std::mem::swap(&mut inner.recipients, recipients);
        std::mem::swap(&mut inner.messages, messages);
        batch
    }

    /// # Safety
    ///
    /// Single-consumer contract as in [`acquire`](Self::acquire).
    unsafe fn take_pooled(&self, class: usize) -> Option<Arc<Batch<T>>> {
        if class >= self.shelves.len() {
            return None;
        }
        loop {
            // SAFETY: Forwarded single-consumer contract.
            let batch = unsafe { self.shelves[class].pop() }?;
            // The pool held the only reference; anything else means a
            // stray handle survived delivery, so skip the entry.
            if Arc::strong_count(&batch) == 1 {
                return Some(batch);
            }
        }
    }

    /// Returns a fully delivered batch to its shelf.
    ///
    /// # Safety
    ///
    /// Must be called from the pump thread (the single producer of the
    /// pool shelves).
    unsafe fn recycle(&self, batch: Arc<Batch<T>>) {
        if batch.class < self.shelves.len() {
            // SAFETY: Forwarded single-producer contract.
            unsafe { self.shelves[batch.class].push(batch) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_is_ceil_log2() {
        assert_eq!(capacity_class(0), 0);
        assert_eq!(capacity_class(1), 0);
        assert_eq!(capacity_class(2), 1);
        assert_eq!(capacity_class(3), 2);
        assert_eq!(capacity_class(4), 2);
        assert_eq!(capacity_class(5), 3);
        assert_eq!(capacity_class(1024), 10);
        assert_eq!(capacity_class(1025), 11);
    }

    fn build(pool: &Arc<BatchPool<i32>>, recipients: &[u32], messages: &[i32]) -> Arc<Batch<i32>> {
        let mut recipient_buf: Vec<ActorId> = recipients.iter().copied().map(ActorId::from).collect();
        let mut message_buf = messages.to_vec();
        // SAFETY: single-threaded test.
        unsafe { pool.acquire(ActorId::from(7), 3, &mut recipient_buf, &mut message_buf) }
    }

    #[test]
    fn acquire_moves_writer_state_in() {
        let pool = BatchPool::<i32>::new();
        let batch = build(&pool, &[1, 2], &[10, 20, 30]);
        assert_eq!(batch.source(), ActorId::from(7));
        assert_eq!(batch.channel(), 3);
        assert_eq!(batch.messages(), &[10, 20, 30]);
        assert_eq!(batch.recipient_count(), 2);
    }

    #[test]
    fn releases_once_per_recipient_then_recycles() {
        let pool = BatchPool::<i32>::new();
        let batch = build(&pool, &[1, 2, 3], &[5]);
        let address = Arc::as_ptr(&batch);

        // One queued reference per recipient, as the dispatch path makes.
        let handles: Vec<BatchRef> = (0..3)
            .map(|_| -> BatchRef { Arc::clone(&batch) as BatchRef })
            .collect();
        drop(batch);
        for handle in handles {
            // SAFETY: single-threaded test; one release per recipient.
            unsafe { handle.release() };
        }

        // The same allocation comes back for the same capacity class,
        // cleared and ready for new contents.
        let reused = build(&pool, &[9], &[6]);
        assert_eq!(Arc::as_ptr(&reused), address);
        assert_eq!(reused.messages(), &[6]);
        assert_eq!(reused.recipients(), &[ActorId::from(9)]);
    }

    #[test]
    fn distinct_classes_use_distinct_shelves() {
        let pool = BatchPool::<i32>::new();
        let small = build(&pool, &[1], &[1, 2]);
        let large = build(&pool, &[1], &(0..100).collect::<Vec<_>>());
        let small_address = Arc::as_ptr(&small);
        let large_address = Arc::as_ptr(&large);

        let small: BatchRef = small;
        let large: BatchRef = large;
        // SAFETY: single-threaded test; one release per recipient.
        unsafe {
            small.release();
            large.release();
        }

        let reused_large = build(&pool, &[1], &(0..100).collect::<Vec<_>>());
        assert_eq!(Arc::as_ptr(&reused_large), large_address);
        let reused_small = build(&pool, &[1], &[3, 4]);
        assert_eq!(Arc::as_ptr(&reused_small), small_address);
    }

    #[test]
    fn dropped_pool_leaves_release_harmless() {
        let pool = BatchPool::<i32>::new();
        let batch = build(&pool, &[1], &[42]);
        drop(pool);
        let batch: BatchRef = batch;
        // SAFETY: single-threaded test; one release for the one recipient.
        unsafe { batch.release() };
    }
}
