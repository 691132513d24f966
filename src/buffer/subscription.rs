//! Consumer side of the ring: ticket leases

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::sync::Unparker;
use crossbeam::utils::CachePadded;
use parking_lot::RwLockReadGuard;

use super::ring::{RingBuffer, Ticket};

/// Per-ticket progress, written only by the owning subscription
pub(crate) struct TicketState {
    pub(crate) index: CachePadded<AtomicU64>,
    pub(crate) evicted: AtomicBool,
    pub(crate) skipped: AtomicU64,
    pub(crate) waker: Option<Unparker>,
}

impl TicketState {
    pub(crate) fn new(start: u64, waker: Option<Unparker>) -> Self {
        Self {
            index: CachePadded::new(AtomicU64::new(start)),
            evicted: AtomicBool::new(false),
            skipped: AtomicU64::new(0),
            waker,
        }
    }
}

/// A registered consumer of one ring.
///
/// Dropping the subscription unregisters its ticket, so a consumer that goes
/// away can never hold the producer back.
pub struct Subscription<T> {
    ring: Arc<RingBuffer<T>>,
    ticket: Ticket,
    state: Arc<TicketState>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(ring: Arc<RingBuffer<T>>, ticket: Ticket, state: Arc<TicketState>) -> Self {
        Self {
            ring,
            ticket,
            state,
        }
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn ring(&self) -> &Arc<RingBuffer<T>> {
        &self.ring
    }

    /// Index of the next slot this subscription will acquire
    pub fn position(&self) -> u64 {
        self.state.index.load(Ordering::Acquire)
    }

    /// Committed slots not yet released
    pub fn lag(&self) -> u64 {
        self.ring.producer_index().saturating_sub(self.position())
    }

    /// Slots lost to eviction
    pub fn skipped(&self) -> u64 {
        self.state.skipped.load(Ordering::Relaxed)
    }

    /// Peek at the next committed slot without advancing.
    ///
    /// Never blocks on the producer. Returns `None` when nothing new has been
    /// committed. Drop the returned reference before calling [`release`](Self::release).
    pub fn acquire(&self) -> Option<SlotRef<'_, T>> {
        if self.state.evicted.load(Ordering::Acquire) {
            self.ring.readmit(self.ticket, &self.state);
        }

        let index = self.state.index.load(Ordering::Relaxed);
        if index >= self.ring.producer_index() {
            return None;
        }

        let guard = self.ring.slot(index).read();
        // The producer may have lapped an evicted ticket before the read lock was taken
        if self.state.evicted.load(Ordering::Acquire) {
            return None;
        }

        Some(SlotRef {
            guard,
            sequence: index,
        })
    }

    /// Retire the slot returned by the last `acquire`
    pub fn release(&self) {
        let index = self.state.index.load(Ordering::Relaxed);
        if index >= self.ring.producer_index() {
            return;
        }
        self.state.index.store(index + 1, Ordering::Release);
        self.ring.wake_producer();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.ring.unsubscribe(self.ticket);
    }
}

/// Read access to an acquired slot
pub struct SlotRef<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    sequence: u64,
}

impl<T> SlotRef<'_, T> {
    /// Index the slot was committed at
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl<T> Deref for SlotRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}
