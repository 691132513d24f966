//! Single-producer / multi-consumer ring with ticket-based backpressure

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::sync::{Parker, Unparker};
use crossbeam::utils::CachePadded;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use super::subscription::{Subscription, TicketState};
use crate::error::RingError;

/// Spins before the producer parks while waiting for space
const SPIN_LIMIT: u32 = 64;

/// Upper bound on a single park so a missed wake-up costs at most this long
const PARK_INTERVAL: Duration = Duration::from_millis(1);

/// Opaque consumer registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u64);

/// What the producer does when the slowest consumer stops advancing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPolicy {
    /// Wait for as long as it takes
    Block,
    /// After the timeout, evict tickets that still block the producer.
    /// Evicted subscriptions resume at the producer's position on their next
    /// `acquire`, losing the backlog they had not read.
    Evict(Duration),
}

impl StallPolicy {
    /// `None` means block forever
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => StallPolicy::Evict(timeout),
            None => StallPolicy::Block,
        }
    }
}

#[derive(Default)]
struct RingCounters {
    commits: AtomicU64,
    waits: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of ring statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: usize,
    pub producer_index: u64,
    pub subscribers: usize,
    pub commits: u64,
    pub waits: u64,
    pub evictions: u64,
}

/// Fixed-capacity ring of preallocated slots.
///
/// One [`RingWriter`] claims and commits slots; any number of
/// [`Subscription`]s acquire and release them at their own pace. The
/// producer never advances more than `capacity` slots past the slowest
/// registered ticket.
pub struct RingBuffer<T> {
    slots: Box<[RwLock<T>]>,
    capacity: u64,
    mask: u64,
    /// Producer index: number of committed slots
    cursor: CachePadded<AtomicU64>,
    tickets: DashMap<Ticket, Arc<TicketState>>,
    next_ticket: AtomicU64,
    /// Bumped on every subscribe so the producer drops its cached minimum
    epoch: AtomicU64,
    /// Held by the producer from claim to commit, and by `subscribe`
    gate: Mutex<()>,
    producer_parked: AtomicBool,
    producer: Unparker,
    closed: AtomicBool,
    policy: StallPolicy,
    counters: RingCounters,
}

impl<T> RingBuffer<T> {
    /// Create a ring of `capacity` slots filled by `factory`.
    ///
    /// Returns the ring and its only writer. `capacity` must be a power of two.
    pub fn new(
        capacity: usize,
        policy: StallPolicy,
        mut factory: impl FnMut() -> T,
    ) -> Result<(Arc<Self>, RingWriter<T>), RingError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(capacity));
        }

        let slots: Box<[RwLock<T>]> = (0..capacity).map(|_| RwLock::new(factory())).collect();
        let parker = Parker::new();

        let ring = Arc::new(Self {
            slots,
            capacity: capacity as u64,
            mask: capacity as u64 - 1,
            cursor: CachePadded::new(AtomicU64::new(0)),
            tickets: DashMap::new(),
            next_ticket: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            gate: Mutex::new(()),
            producer_parked: AtomicBool::new(false),
            producer: parker.unparker().clone(),
            closed: AtomicBool::new(false),
            policy,
            counters: RingCounters::default(),
        });

        let writer = RingWriter {
            ring: ring.clone(),
            state: WriterState {
                parker,
                cached_min: 0,
                seen_epoch: 0,
            },
        };
        Ok((ring, writer))
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn policy(&self) -> StallPolicy {
        self.policy
    }

    /// Number of committed slots so far
    pub fn producer_index(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Current index of a registered ticket
    pub fn consumer_index(&self, ticket: Ticket) -> Option<u64> {
        self.tickets
            .get(&ticket)
            .map(|state| state.index.load(Ordering::Acquire))
    }

    pub fn subscriber_count(&self) -> usize {
        self.tickets.len()
    }

    /// Register a consumer starting `capacity` slots behind the producer (or at 0)
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        self.register(None)
    }

    /// Like [`subscribe`](Self::subscribe); `waker` is unparked on every commit
    pub fn subscribe_with_waker(self: &Arc<Self>, waker: Unparker) -> Subscription<T> {
        self.register(Some(waker))
    }

    fn register(self: &Arc<Self>, waker: Option<Unparker>) -> Subscription<T> {
        // No claim is in flight while the gate is held
        let _gate = self.gate.lock();
        let start = self.cursor.load(Ordering::Acquire).saturating_sub(self.capacity);
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(TicketState::new(start, waker));

        self.tickets.insert(ticket, state.clone());
        self.epoch.fetch_add(1, Ordering::Release);

        tracing::debug!(ticket = ticket.0, start, "Ticket registered");
        Subscription::new(self.clone(), ticket, state)
    }

    /// Drop a ticket from backpressure accounting
    pub fn unsubscribe(&self, ticket: Ticket) -> bool {
        let removed = self.tickets.remove(&ticket).is_some();
        if removed {
            tracing::debug!(ticket = ticket.0, "Ticket unregistered");
            self.wake_producer();
        }
        removed
    }

    /// Make every current and future `claim` fail with [`RingError::Closed`]
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.producer.unpark();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            capacity: self.capacity as usize,
            producer_index: self.producer_index(),
            subscribers: self.tickets.len(),
            commits: self.counters.commits.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Slowest registered index, or `fallback` with no consumers
    fn min_consumer_index(&self, fallback: u64) -> u64 {
        self.tickets
            .iter()
            .map(|entry| entry.value().index.load(Ordering::Acquire))
            .min()
            .unwrap_or(fallback)
    }

    /// Evict every ticket that keeps the producer from writing `next`
    fn evict_blockers(&self, next: u64) {
        let capacity = self.capacity;
        let counters = &self.counters;
        self.tickets.retain(|ticket, state| {
            let index = state.index.load(Ordering::Acquire);
            if index + capacity > next {
                return true;
            }
            state.evicted.store(true, Ordering::Release);
            counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                ticket = ticket.0,
                index,
                producer_index = next,
                "Evicting stalled consumer"
            );
            false
        });
    }

    pub(crate) fn wake_producer(&self) {
        if self.producer_parked.load(Ordering::SeqCst) {
            self.producer.unpark();
        }
    }

    fn wake_consumers(&self) {
        for entry in self.tickets.iter() {
            if let Some(waker) = &entry.value().waker {
                waker.unpark();
            }
        }
    }

    /// Put an evicted ticket back at the producer's position
    pub(crate) fn readmit(&self, ticket: Ticket, state: &Arc<TicketState>) {
        let cursor = self.cursor.load(Ordering::Acquire);
        let skipped = cursor.saturating_sub(state.index.load(Ordering::Relaxed));
        state.skipped.fetch_add(skipped, Ordering::Relaxed);
        state.index.store(cursor, Ordering::Release);
        state.evicted.store(false, Ordering::Release);
        self.tickets.insert(ticket, state.clone());
        tracing::info!(ticket = ticket.0, skipped, "Evicted consumer resumed");
    }

    pub(crate) fn slot(&self, index: u64) -> &RwLock<T> {
        &self.slots[(index & self.mask) as usize]
    }
}

/// Producer handle; exactly one exists per ring
pub struct RingWriter<T> {
    ring: Arc<RingBuffer<T>>,
    state: WriterState,
}

/// Producer-private wait state, kept apart from the ring borrow
struct WriterState {
    parker: Parker,
    /// Lower bound on every registered consumer index
    cached_min: u64,
    seen_epoch: u64,
}

impl<T> RingWriter<T> {
    pub fn ring(&self) -> &Arc<RingBuffer<T>> {
        &self.ring
    }

    /// Wait for a free slot and lock it for writing.
    ///
    /// Waiting spins briefly, then parks until a consumer releases. Under
    /// [`StallPolicy::Evict`] the wait is bounded; under `Block` it is not.
    /// Dropping the claim without committing publishes nothing.
    pub fn claim(&mut self) -> Result<Claim<'_, T>, RingError> {
        let ring = &*self.ring;
        let state = &mut self.state;
        let started = Instant::now();

        loop {
            let next = state.wait_for_space(ring, started)?;

            let gate = ring.gate.lock();
            let epoch = ring.epoch.load(Ordering::Acquire);
            if epoch != state.seen_epoch {
                // A consumer subscribed since the cached minimum was taken
                state.seen_epoch = epoch;
                state.cached_min = ring.min_consumer_index(next);
                if next >= state.cached_min + ring.capacity {
                    drop(gate);
                    continue;
                }
            }

            let slot = match ring.policy {
                StallPolicy::Block => ring.slot(next).write(),
                StallPolicy::Evict(timeout) => ring
                    .slot(next)
                    .try_write_for(timeout)
                    .ok_or(RingError::SlotBusy(next))?,
            };

            return Ok(Claim {
                ring,
                _gate: gate,
                slot,
                sequence: next,
            });
        }
    }

    /// Claim without waiting; `None` when the slowest consumer is a full ring behind
    pub fn try_claim(&mut self) -> Option<Claim<'_, T>> {
        let ring = &*self.ring;
        let state = &mut self.state;
        if ring.is_closed() {
            return None;
        }

        let gate = ring.gate.lock();
        let next = ring.cursor.load(Ordering::Relaxed);
        state.seen_epoch = ring.epoch.load(Ordering::Acquire);
        state.cached_min = ring.min_consumer_index(next);
        if next >= state.cached_min + ring.capacity {
            return None;
        }

        let slot = ring.slot(next).try_write()?;
        Some(Claim {
            ring,
            _gate: gate,
            slot,
            sequence: next,
        })
    }
}

impl WriterState {
    /// Return the next index once it is within `capacity` of the slowest consumer
    fn wait_for_space<T>(&mut self, ring: &RingBuffer<T>, started: Instant) -> Result<u64, RingError> {
        if ring.is_closed() {
            return Err(RingError::Closed);
        }
        let next = ring.cursor.load(Ordering::Relaxed);
        if next < self.cached_min + ring.capacity {
            return Ok(next);
        }

        let mut spins = 0;
        let mut counted = false;
        loop {
            self.cached_min = ring.min_consumer_index(next);
            if next < self.cached_min + ring.capacity {
                return Ok(next);
            }
            if ring.is_closed() {
                return Err(RingError::Closed);
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }

            if let StallPolicy::Evict(timeout) = ring.policy {
                if started.elapsed() >= timeout {
                    ring.evict_blockers(next);
                    continue;
                }
            }

            if !counted {
                counted = true;
                ring.counters.waits.fetch_add(1, Ordering::Relaxed);
            }

            ring.producer_parked.store(true, Ordering::SeqCst);
            // Re-check after announcing the park so a concurrent release is not missed
            self.cached_min = ring.min_consumer_index(next);
            if next < self.cached_min + ring.capacity {
                ring.producer_parked.store(false, Ordering::SeqCst);
                return Ok(next);
            }
            self.parker.park_timeout(PARK_INTERVAL);
            ring.producer_parked.store(false, Ordering::SeqCst);
        }
    }
}

/// A claimed, write-locked slot. `commit` publishes it.
pub struct Claim<'a, T> {
    ring: &'a RingBuffer<T>,
    _gate: MutexGuard<'a, ()>,
    slot: RwLockWriteGuard<'a, T>,
    sequence: u64,
}

impl<'a, T> Claim<'a, T> {
    /// Index this slot will be published at
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Publish the slot to every consumer
    pub fn commit(self) {
        let Claim {
            ring,
            _gate,
            slot,
            sequence,
        } = self;

        drop(slot);
        // Release pairs with the consumers' Acquire load of the cursor
        ring.cursor.store(sequence + 1, Ordering::Release);
        drop(_gate);

        ring.counters.commits.fetch_add(1, Ordering::Relaxed);
        ring.wake_consumers();
    }
}

impl<T> Deref for Claim<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.slot
    }
}

impl<T> DerefMut for Claim<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.slot
    }
}
