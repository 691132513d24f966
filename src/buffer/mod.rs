//! Ring buffers connecting producers to consumers
//!
//! Each producer owns one [`RingBuffer`] of preallocated slots. Consumers hold
//! [`Subscription`]s (ticket leases) and move through the ring independently:
//!
//! ```text
//!   producer:  claim ─► fill ─► commit          (RingWriter, single owner)
//!                                  │
//!              ┌───────────────────┼───────────────────┐
//!              ▼                   ▼                   ▼
//!   consumer:  acquire ─► inspect ─► release    (one Subscription per ticket)
//! ```
//!
//! The producer may run at most `capacity` slots ahead of the slowest ticket.

mod ring;
mod subscription;

pub use ring::{Claim, RingBuffer, RingStats, RingWriter, StallPolicy, Ticket};
pub use subscription::{SlotRef, Subscription};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn ring(capacity: usize) -> (Arc<RingBuffer<u64>>, RingWriter<u64>) {
        RingBuffer::new(capacity, StallPolicy::Block, || 0u64).unwrap()
    }

    fn publish(writer: &mut RingWriter<u64>) -> u64 {
        let mut claim = writer.claim().unwrap();
        let sequence = claim.sequence();
        *claim = sequence;
        claim.commit();
        sequence
    }

    #[test]
    fn test_rejects_bad_capacity() {
        assert!(RingBuffer::new(3, StallPolicy::Block, || 0u8).is_err());
        assert!(RingBuffer::new(1, StallPolicy::Block, || 0u8).is_err());
        assert!(RingBuffer::new(16, StallPolicy::Block, || 0u8).is_ok());
    }

    #[test]
    fn test_acquire_does_not_advance() {
        let (ring, mut writer) = ring(4);
        let sub = ring.subscribe();
        assert!(sub.acquire().is_none());

        publish(&mut writer);
        assert_eq!(*sub.acquire().unwrap(), 0);
        // Peeking twice sees the same slot
        assert_eq!(*sub.acquire().unwrap(), 0);
        sub.release();
        assert!(sub.acquire().is_none());
        assert_eq!(sub.position(), 1);
    }

    #[test]
    fn test_release_without_data_is_ignored() {
        let (ring, mut writer) = ring(4);
        let sub = ring.subscribe();
        sub.release();
        assert_eq!(sub.position(), 0);
        publish(&mut writer);
        assert_eq!(*sub.acquire().unwrap(), 0);
    }

    #[test]
    fn test_slowest_ticket_bounds_producer() {
        let (ring, mut writer) = ring(4);
        let slow = ring.subscribe();
        let fast = ring.subscribe();

        for _ in 0..4 {
            publish(&mut writer);
            fast.acquire().unwrap();
            fast.release();
        }
        assert!(writer.try_claim().is_none());

        slow.acquire().unwrap();
        slow.release();
        assert!(writer.try_claim().is_some());
    }

    #[test]
    fn test_dropped_subscription_unblocks_producer() {
        let (ring, mut writer) = ring(2);
        let sub = ring.subscribe();
        publish(&mut writer);
        publish(&mut writer);
        assert!(writer.try_claim().is_none());

        drop(sub);
        assert_eq!(ring.subscriber_count(), 0);
        assert!(writer.try_claim().is_some());
    }

    #[test]
    fn test_abandoned_claim_publishes_nothing() {
        let (ring, mut writer) = ring(4);
        let sub = ring.subscribe();
        {
            let mut claim = writer.claim().unwrap();
            *claim = 99;
        }
        assert_eq!(ring.producer_index(), 0);
        assert!(sub.acquire().is_none());
    }

    #[test]
    fn test_late_subscriber_starts_one_ring_behind() {
        let (ring, mut writer) = ring(8);
        for _ in 0..3 {
            publish(&mut writer);
        }
        let early = ring.subscribe();
        assert_eq!(early.position(), 0);
        drop(early);

        for _ in 3..20 {
            publish(&mut writer);
        }
        let late = ring.subscribe();
        assert_eq!(late.position(), 12);
        assert_eq!(*late.acquire().unwrap(), 12);
    }

    #[test]
    fn test_fifo_across_threads() {
        const COUNT: u64 = 20_000;
        let (ring, mut writer) = ring(64);
        let sub = ring.subscribe();

        let producer = thread::spawn(move || {
            for _ in 0..COUNT {
                publish(&mut writer);
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            if let Some(slot) = sub.acquire() {
                assert_eq!(*slot, expected);
                assert_eq!(slot.sequence(), expected);
                drop(slot);
                sub.release();
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(ring.stats().commits, COUNT);
    }

    #[test]
    fn test_evict_policy_skips_stalled_ticket() {
        let (ring, mut writer) =
            RingBuffer::new(4, StallPolicy::Evict(Duration::from_millis(10)), || 0u64).unwrap();
        let stalled = ring.subscribe();

        for _ in 0..5 {
            publish(&mut writer);
        }
        assert_eq!(ring.stats().evictions, 1);
        assert_eq!(ring.subscriber_count(), 0);

        // Resumes at the producer position, backlog skipped
        assert!(stalled.acquire().is_none());
        assert_eq!(stalled.skipped(), 5);
        assert_eq!(ring.subscriber_count(), 1);

        publish(&mut writer);
        assert_eq!(*stalled.acquire().unwrap(), 5);
    }

    #[test]
    fn test_claim_wakes_after_release() {
        let (ring, mut writer) = ring(2);
        let sub = ring.subscribe();
        publish(&mut writer);
        publish(&mut writer);

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sub.acquire().unwrap();
            sub.release();
            sub
        });

        // Blocks until the consumer frees a slot
        assert_eq!(publish(&mut writer), 2);
        let sub = consumer.join().unwrap();
        assert_eq!(sub.position(), 1);
        assert!(ring.stats().waits >= 1);
    }

    #[test]
    fn test_close_unblocks_waiting_producer() {
        let (ring, mut writer) = ring(2);
        let _stalled = ring.subscribe();
        publish(&mut writer);
        publish(&mut writer);

        let producer = thread::spawn(move || writer.claim().map(|claim| claim.sequence()));
        thread::sleep(Duration::from_millis(20));
        ring.close();

        assert_eq!(producer.join().unwrap(), Err(crate::error::RingError::Closed));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Produce,
        Consume(usize),
        Subscribe,
        Unsubscribe(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Produce),
            4 => (0usize..4).prop_map(Op::Consume),
            1 => Just(Op::Subscribe),
            1 => (0usize..4).prop_map(Op::Unsubscribe),
        ]
    }

    proptest! {
        #[test]
        fn prop_backpressure_and_fifo(ops in prop::collection::vec(op(), 1..400)) {
            let (ring, mut writer) = ring(8);
            let capacity = ring.capacity() as u64;
            let mut subs: Vec<(Subscription<u64>, Option<u64>)> = vec![(ring.subscribe(), None)];

            for op in ops {
                match op {
                    Op::Produce => {
                        if let Some(mut claim) = writer.try_claim() {
                            let sequence = claim.sequence();
                            *claim = sequence;
                            claim.commit();
                        }
                    }
                    Op::Consume(i) => {
                        if subs.is_empty() {
                            continue;
                        }
                        let idx = i % subs.len();
                        let (sub, last) = &mut subs[idx];
                        if let Some(slot) = sub.acquire() {
                            let value = *slot;
                            drop(slot);
                            if let Some(previous) = *last {
                                prop_assert_eq!(value, previous + 1);
                            }
                            *last = Some(value);
                            sub.release();
                        }
                    }
                    Op::Subscribe => {
                        let sub = ring.subscribe();
                        let producer = ring.producer_index();
                        prop_assert_eq!(sub.position(), producer.saturating_sub(capacity));
                        subs.push((sub, None));
                    }
                    Op::Unsubscribe(i) => {
                        if !subs.is_empty() {
                            let idx = i % subs.len();
                            subs.remove(idx);
                        }
                    }
                }

                let producer = ring.producer_index();
                for (sub, _) in &subs {
                    let position = sub.position();
                    prop_assert!(position <= producer);
                    prop_assert!(producer - position <= capacity);
                }
            }
        }
    }
}
