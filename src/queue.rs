// FPGA msgDMA User-Mode Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Bounded transfer queue shared between the caller and the workers.
//!
//! The queue is a fixed ring of slots guarded by one mutex, paired with a
//! counting semaphore that tracks occupied slots. Enqueue never blocks:
//! a full queue hands the item straight back so the producer can apply
//! its own backpressure. Dequeue blocks until an item or the terminate
//! sentinel is available.
//!
//! The sentinel is never consumed. A consumer that finds it at the head
//! returns [`Dequeued::Closed`] and re-posts the semaphore so every other
//! waiter observes the closure too.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Result of a blocking dequeue.
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item(T),
    /// The queue was closed; no further items will be delivered.
    Closed,
}

/// Why an item could not be enqueued. Carries the item back.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError<T> {
    /// All slots are occupied; retry later.
    Busy(T),
    /// The queue has been closed.
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Busy(item) | Self::Closed(item) => item,
        }
    }
}

enum Slot<T> {
    Item(T),
    Terminate,
}

struct Ring<T> {
    slots: Vec<Option<Slot<T>>>,
    head: usize,
    tail: usize,
    /// Occupied slots, sentinel included.
    occupied: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn push(&mut self, slot: Slot<T>) {
        self.slots[self.tail] = Some(slot);
        self.tail = (self.tail + 1) % self.slots.len();
        self.occupied += 1;
    }
}

/// Counting semaphore on a mutex and condition variable.
struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *permits += 1;
        self.cond.notify_one();
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    fn acquire_timeout(&self, timeout: Duration) -> bool {
        let permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut permits, _) = self
            .cond
            .wait_timeout_while(permits, timeout, |p| *p == 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }
}

/// Fixed-capacity multi-producer, multi-consumer FIFO.
pub struct TransferQueue<T> {
    ring: Mutex<Ring<T>>,
    items: Semaphore,
    capacity: usize,
}

impl<T> TransferQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        // One spare slot is reserved for the terminate sentinel.
        let slots = (0..=capacity).map(|_| None).collect();
        Self {
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                occupied: 0,
                closed: false,
            }),
            items: Semaphore::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently queued, excluding the sentinel.
    pub fn len(&self) -> usize {
        let ring = self.lock();
        ring.occupied - usize::from(ring.closed && ring.occupied > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        // Ring updates never panic midway, so a poisoned lock still guards
        // consistent cursors.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item without blocking.
    ///
    /// # Errors
    ///
    /// Returns the item in [`EnqueueError::Busy`] when the queue is full and
    /// in [`EnqueueError::Closed`] after [`close`](Self::close).
    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        {
            let mut ring = self.lock();
            if ring.closed {
                return Err(EnqueueError::Closed(item));
            }
            if ring.occupied >= self.capacity {
                return Err(EnqueueError::Busy(item));
            }
            ring.push(Slot::Item(item));
        }
        self.items.post();
        Ok(())
    }

    /// Remove the oldest item, blocking until one is available or the
    /// queue is closed.
    pub fn dequeue(&self) -> Dequeued<T> {
        self.items.acquire();
        self.take_head()
    }

    /// Like [`dequeue`](Self::dequeue) but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<Dequeued<T>> {
        if self.items.acquire_timeout(timeout) {
            Some(self.take_head())
        } else {
            None
        }
    }

    fn take_head(&self) -> Dequeued<T> {
        let mut ring = self.lock();
        let head = ring.head;
        match ring.slots[head].take() {
            Some(Slot::Item(item)) => {
                ring.head = (head + 1) % ring.slots.len();
                ring.occupied -= 1;
                Dequeued::Item(item)
            }
            Some(Slot::Terminate) => {
                ring.slots[head] = Some(Slot::Terminate);
                drop(ring);
                self.items.post();
                Dequeued::Closed
            }
            // A permit always matches an occupied slot.
            None => unreachable!("queue permit without an occupied slot"),
        }
    }

    /// Append the terminate sentinel. Items already queued are still
    /// delivered first; afterwards every dequeue returns `Closed`.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) {
        {
            let mut ring = self.lock();
            if ring.closed {
                return;
            }
            ring.closed = true;
            ring.push(Slot::Terminate);
        }
        self.items.post();
    }

    /// Remove every queued item without delivering it, oldest first.
    ///
    /// Items already claimed by a blocked consumer are not affected.
    pub fn drain(&self) -> Vec<T> {
        let mut drained = Vec::new();
        loop {
            if !self.items.try_acquire() {
                break;
            }
            let mut ring = self.lock();
            let head = ring.head;
            match ring.slots[head].take() {
                Some(Slot::Item(item)) => {
                    ring.head = (head + 1) % ring.slots.len();
                    ring.occupied -= 1;
                    drained.push(item);
                }
                other => {
                    ring.slots[head] = other;
                    drop(ring);
                    self.items.post();
                    break;
                }
            }
        }
        drained
    }
}

impl<T> std::fmt::Debug for TransferQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.lock();
        f.debug_struct("TransferQueue")
            .field("capacity", &self.capacity)
            .field("occupied", &ring.occupied)
            .field("closed", &ring.closed)
            .finish()
    }
}
