//! Bounded lock-free SPSC ring buffer.
//!
//! Fixed power-of-two capacity, monotonically increasing 64-bit read and
//! write positions, slot index `pos & (capacity - 1)`. The buffer is empty
//! iff `read == write` and full iff `write - read == capacity`, with
//! wrap-safe unsigned subtraction.
//!
//! One thread may push, one thread may pop; the two may be different
//! threads. [`push`](Ring::push) and [`pop`](Ring::pop) are `unsafe fn`
//! because the compiler cannot enforce that contract; the safe handle pair
//! in [`chain`](crate::chain) does.
//!
//! # Memory ordering
//!
//! - **push**: `Acquire` load of `read` for the full check, `Release`
//!   store of `write` after the slot is written, so the consumer observes
//!   the value strictly before the position increment.
//! - **pop**: `Acquire` load of `write` for the empty check (pairs with
//!   the producer's `Release`), `Release` store of `read` after the slot
//!   is moved out (pairs with the producer's `Acquire` full check, so the
//!   producer never overwrites a slot still being read).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-capacity single-producer, single-consumer queue.
pub struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: u64,
    read: AtomicU64,
    write: AtomicU64,
}

// SAFETY: Slots are plain storage; moving the ring between threads moves
// the owned `T` values with it.
unsafe impl<T: Send> Send for Ring<T> {}
// SAFETY: Concurrent access is limited by the SPSC contract on `push` and
// `pop`; every slot is accessed by exactly one side at a time, handed over
// through the Release/Acquire pairs on the position counters.
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Creates a ring with at least `capacity` slots, rounded up to the
    /// next power of two (minimum 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            slots,
            mask: capacity as u64 - 1,
            read: AtomicU64::new(0),
            write: AtomicU64::new(0),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "masked position is always below the slot count"
    )]
    fn slot(&self, pos: u64) -> *mut MaybeUninit<T> {
        self.slots[(pos & self.mask) as usize].get()
    }

    /// Enqueues `value`, or returns it back when the ring is full.
    ///
    /// # Safety
    ///
    /// Only one thread may push at a time (the producer).
    pub unsafe fn push(&self, value: T) -> Result<(), T> {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        if write.wrapping_sub(read) == self.slots.len() as u64 {
            return Err(value);
        }
        // SAFETY: The slot at `write` is unoccupied (the full check above)
        // and no other thread writes slots (single producer).
        unsafe {
            (*self.slot(write)).write(value);
        }
        self.write.store(write.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeues the oldest value, or `None` when the ring is empty.
    ///
    /// # Safety
    ///
    /// Only one thread may pop at a time (the consumer).
    pub unsafe fn pop(&self) -> Option<T> {
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        // SAFETY: `read < write`, so the slot holds an initialized value
        // published by the producer's Release store; no other thread reads
        // slots (single consumer).
        let value = unsafe { (*self.slot(read)).assume_init_read() };
        self.read.store(read.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Consumer-side empty check.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read.load(Ordering::Relaxed) == self.write.load(Ordering::Acquire)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let write = self.write.load(Ordering::Relaxed);
        let mut read = self.read.load(Ordering::Relaxed);
        while read != write {
            // SAFETY: We have `&mut self`, so no concurrent access; every
            // position in `read..write` holds an initialized value.
            unsafe {
                (*self.slot(read)).assume_init_drop();
            }
            read = read.wrapping_add(1);
        }
    }
}
