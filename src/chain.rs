//! Unbounded SPSC queue built from a chain of doubling ring buffers.
//!
//! A [`Chain`] starts with a single [`Ring`] node. When the producer finds
//! the current write node full it allocates a successor with twice the
//! capacity, links it, and continues there; nodes never shrink. The
//! consumer drains the oldest node, then advances along the links, freeing
//! each exhausted node as it goes.
//!
//! The successor link is published with release semantics
//! ([`OnceLock::set`]) and read with acquire semantics ([`OnceLock::get`]).
//! After observing a successor, the consumer re-checks the current node
//! once more before advancing: a value pushed just before the link was
//! installed becomes visible through that acquire, so nothing is lost at
//! the boundary.
//!
//! [`Chain`] itself exposes the raw `unsafe` SPSC surface (one pushing
//! thread, one popping thread, as [`Ring`] requires). [`channel`] wraps it
//! in a pair of single-owner handles whose methods are safe: holding the
//! unique [`ChainSender`] *is* the producer role, holding the unique
//! [`ChainReceiver`] is the consumer role.

use std::cell::UnsafeCell;
use std::sync::{Arc, OnceLock};

use crate::ring::Ring;

/// Default capacity of the first node of a chain.
pub const DEFAULT_CHAIN_CAPACITY: usize = 32;

struct Node<T> {
    ring: Ring<T>,
    next: OnceLock<Arc<Node<T>>>,
}

impl<T> Node<T> {
    fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            ring: Ring::with_capacity(capacity),
            next: OnceLock::new(),
        })
    }
}

/// Unbounded single-producer, single-consumer queue.
pub struct Chain<T> {
    read: UnsafeCell<Arc<Node<T>>>,
    write: UnsafeCell<Arc<Node<T>>>,
}

// SAFETY: All shared state lives in the nodes, which are `Sync` for
// `T: Send` (see `Ring`); the `UnsafeCell` cursors are each touched by
// exactly one thread under the SPSC contract on `push`/`pop`.
unsafe impl<T: Send> Send for Chain<T> {}
// SAFETY: As above; the producer only touches `write`, the consumer only
// touches `read`.
unsafe impl<T: Send> Sync for Chain<T> {}

impl<T> Chain<T> {
    /// Creates a chain whose first node holds `initial_capacity` slots
    /// (rounded up to a power of two).
    #[must_use]
    pub fn new(initial_capacity: usize) -> Self {
        let node = Node::with_capacity(initial_capacity);
        Self {
            read: UnsafeCell::new(Arc::clone(&node)),
            write: UnsafeCell::new(node),
        }
    }

    /// Enqueues `value`, growing the chain when the write node is full.
    ///
    /// # Safety
    ///
    /// Only one thread may push at a time (the producer).
    pub unsafe fn push(&self, value: T) {
        // SAFETY: The write cursor is producer-owned; the caller is the
        // single producer.
        let write = unsafe { &mut *self.write.get() };
        // SAFETY: Single producer per the caller's contract.
        let value = match unsafe { write.ring.push(value) } {
            Ok(()) => return,
            Err(value) => value,
        };

        // Current node is full: link a successor with double the capacity
        // and move the write cursor there. The producer stops touching the
        // old node from here on.
        let node = Node::with_capacity(write.ring.capacity() * 2);
        let _ = write.next.set(Arc::clone(&node));
        *write = node;
        // SAFETY: Single producer; the fresh node is empty and at least as
        // large as the one that was just full, so this cannot fail.
        if unsafe { write.ring.push(value) }.is_err() {
            unreachable!("freshly linked chain node rejected a value");
        }
    }

    /// Dequeues the oldest value across all nodes.
    ///
    /// # Safety
    ///
    /// Only one thread may pop at a time (the consumer).
    pub unsafe fn pop(&self) -> Option<T> {
        // SAFETY: The read cursor is consumer-owned; the caller is the
        // single consumer.
        let read = unsafe { &mut *self.read.get() };
        loop {
            // SAFETY: Single consumer per the caller's contract.
            if let Some(value) = unsafe { read.ring.pop() } {
                return Some(value);
            }
            let Some(next) = read.next.get() else {
                return None;
            };
            // A successor exists, so the producer has abandoned this node.
            // Re-check it once after the acquire load of the link: a value
            // pushed right before the link was installed is visible now.
            // SAFETY: Single consumer per the caller's contract.
            if let Some(value) = unsafe { read.ring.pop() } {
                return Some(value);
            }
            let next = Arc::clone(next);
            // Dropping the old cursor frees the exhausted node (the
            // producer holds no reference to it anymore).
            *read = next;
        }
    }

    /// Capacities of the nodes from the read cursor onwards.
    #[cfg(test)]
    fn node_capacities(&self) -> Vec<usize> {
        // SAFETY: Tests call this from the consumer thread only.
        let mut node = Arc::clone(unsafe { &*self.read.get() });
        let mut capacities = vec![node.ring.capacity()];
        while let Some(next) = node.next.get() {
            capacities.push(next.ring.capacity());
            node = Arc::clone(next);
        }
        capacities
    }
}

/// Creates a connected sender/receiver pair over a fresh [`Chain`].
pub fn channel<T>(initial_capacity: usize) -> (ChainSender<T>, ChainReceiver<T>) {
    let chain = Arc::new(Chain::new(initial_capacity));
    (
        ChainSender {
            chain: Arc::clone(&chain),
        },
        ChainReceiver { chain },
    )
}

/// Unique producer handle for a [`Chain`].
pub struct ChainSender<T> {
    chain: Arc<Chain<T>>,
}

impl<T: Send> ChainSender<T> {
    /// Enqueues `value`; never fails, the chain grows as needed.
    pub fn push(&mut self, value: T) {
        // SAFETY: This handle is not cloneable, so holding `&mut self`
        // makes this thread the single producer.
        unsafe { self.chain.push(value) };
    }
}

/// Unique consumer handle for a [`Chain`].
pub struct ChainReceiver<T> {
    chain: Arc<Chain<T>>,
}

impl<T: Send> ChainReceiver<T> {
    /// Dequeues the oldest value, or `None` when the chain is empty.
    pub fn pop(&mut self) -> Option<T> {
        // SAFETY: This handle is not cloneable, so holding `&mut self`
        // makes this thread the single consumer.
        unsafe { self.chain.pop() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn crosses_the_capacity_boundary_in_order() {
        let chain = Chain::new(4);
        for i in 0..5 {
            // SAFETY: single-threaded test.
            unsafe { chain.push(i) };
        }
        for i in 0..5 {
            // SAFETY: single-threaded test.
            assert_eq!(unsafe { chain.pop() }, Some(i));
        }
        // SAFETY: single-threaded test.
        assert_eq!(unsafe { chain.pop() }, None);
    }

    #[test]
    fn grows_by_doubling_from_initial_capacity_two() {
        let chain = Chain::new(2);
        for i in 1..=40 {
            // SAFETY: single-threaded test.
            unsafe { chain.push(i) };
        }

        let capacities = chain.node_capacities();
        assert!(capacities.len() >= 5, "expected at least 5 nodes");
        assert_eq!(&capacities[..5], &[2, 4, 8, 16, 32]);

        for i in 1..=40 {
            // SAFETY: single-threaded test.
            assert_eq!(unsafe { chain.pop() }, Some(i));
        }
        // SAFETY: single-threaded test.
        assert_eq!(unsafe { chain.pop() }, None);
    }

    #[test]
    fn interleaved_push_pop_across_nodes() {
        let (mut tx, mut rx) = channel(2);
        let mut expected = 0;
        for round in 0..50 {
            for i in 0..round {
                tx.push(round * 100 + i);
            }
            for i in 0..round {
                assert_eq!(rx.pop(), Some(round * 100 + i));
            }
        }
        for i in 0..10 {
            tx.push(i);
        }
        while let Some(value) = rx.pop() {
            assert_eq!(value, expected);
            expected += 1;
        }
        assert_eq!(expected, 10);
    }

    #[test]
    fn handle_pair_is_fifo_across_threads() {
        const COUNT: u64 = 100_000;
        let (mut tx, mut rx) = channel(2);

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                tx.push(i);
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            if let Some(value) = rx.pop() {
                assert_eq!(value, expected, "out-of-order delivery");
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().expect("producer panicked");
    }

    #[test]
    fn dropping_the_chain_drops_queued_values() {
        let value = std::sync::Arc::new(());
        let (mut tx, rx) = channel(2);
        for _ in 0..10 {
            tx.push(std::sync::Arc::clone(&value));
        }
        assert_eq!(std::sync::Arc::strong_count(&value), 11);
        drop(tx);
        drop(rx);
        assert_eq!(std::sync::Arc::strong_count(&value), 1);
    }
}
