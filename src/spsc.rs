//! Bounded single-producer/single-consumer channel.
//!
//! A fixed ring of `capacity` slots with monotonically increasing head/tail
//! counters. The producer owns `tail`, the consumer owns `head`; each side
//! publishes its counter with `Release` and reads the other's with `Acquire`,
//! so no lock is needed. `push` never blocks and never overwrites: a full
//! ring hands the value back in [`PushError::Full`]. `pop` never blocks.
//!
//! Single-producer/single-consumer is enforced by the types: [`channel`]
//! returns exactly one [`Producer`] and one [`Consumer`], neither is `Clone`,
//! and both mutate through `&mut self`. When several threads must feed one
//! channel, wrap the producer in a [`SharedProducer`], which serializes the
//! producer side with one mutex.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::warn;

struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot to read. Written only by the consumer.
    head: AtomicUsize,
    /// Next slot to write. Written only by the producer.
    tail: AtomicUsize,
    rejected: AtomicU64,
    name: &'static str,
}

// SAFETY: a slot is only ever accessed by the producer (between its tail
// check and the Release store of `tail`) or by the consumer (between its
// Acquire load of `tail` and the Release store of `head`), never both.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, counter: usize) -> *mut MaybeUninit<T> {
        self.slots[counter % self.slots.len()].get()
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut i = head;
        while i != tail {
            // SAFETY: every slot in [head, tail) holds an initialized value
            // and we have exclusive access during drop.
            unsafe { (*self.slot(i)).assume_init_drop() };
            i = i.wrapping_add(1);
        }
    }
}

/// Create a channel holding at most `capacity` values (at least 1).
///
/// `name` only shows up in logs.
pub fn channel<T: Send>(name: &'static str, capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = capacity.max(1);
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Ring {
        slots,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        rejected: AtomicU64::new(0),
        name,
    });
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

/// A value that could not be pushed because the channel was full.
pub enum PushError<T> {
    Full(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(v) => v,
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel is full")
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Writing half. Exactly one exists per channel.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Producer<T> {
    pub fn push(&mut self, value: T) -> Result<(), PushError<T>> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == ring.capacity() {
            ring.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PushError::Full(value));
        }
        // SAFETY: slot `tail` is outside [head, tail) so the consumer does
        // not touch it until we publish the new tail below.
        unsafe { (*ring.slot(tail)).write(value) };
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Push, and on a full channel drop the value with a warning.
    ///
    /// Returns whether the value was accepted.
    pub fn push_or_drop(&mut self, value: T) -> bool {
        match self.push(value) {
            Ok(()) => true,
            Err(PushError::Full(_)) => {
                warn!("spsc[{}]: channel full, result dropped", self.ring.name);
                false
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Reading half. Exactly one exists per channel.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Consumer<T> {
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: slot `head` is inside [head, tail), fully written by the
        // producer before its Release store of `tail`.
        let value = unsafe { (*ring.slot(head)).assume_init_read() };
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Pop until the channel is empty.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.pop())
    }

    pub fn len(&self) -> usize {
        let tail = self.ring.tail.load(Ordering::Acquire);
        let head = self.ring.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of pushes refused because the channel was full.
    pub fn rejected(&self) -> u64 {
        self.ring.rejected.load(Ordering::Relaxed)
    }
}

/// A producer shared by several one-shot tasks (e.g. thumbnail fan-out).
/// Pushes are serialized by one mutex, keeping the ring single-producer.
pub struct SharedProducer<T> {
    inner: Arc<Mutex<Producer<T>>>,
}

impl<T> Clone for SharedProducer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedProducer<T> {
    pub fn new(producer: Producer<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(producer)),
        }
    }

    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value)
    }

    pub fn push_or_drop(&self, value: T) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_or_drop(value)
    }
}
