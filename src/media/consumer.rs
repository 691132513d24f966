//! Consumer driver: round-robin poll over subscribed rings

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::sync::{Parker, Unparker};
use crossbeam_channel::{unbounded, Sender as ChannelSender};

use super::producer::{PacketRing, Producer};
use crate::buffer::Subscription;
use crate::error::MediaError;
use crate::packet::{KindMask, Packet};
use crate::worker::{Schedule, Worker};

/// A component that handles packets from one or more rings
pub trait Consume: Send + 'static {
    /// Kinds this consumer handles; everything else is released unseen
    fn interest(&self) -> KindMask;

    fn consume(&mut self, packet: &Packet);
}

/// Consumer counters
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub consumed: AtomicU64,
    pub filtered: AtomicU64,
    pub subscriptions: AtomicU64,
}

impl ConsumerStats {
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }
}

/// A running consumer and the thread polling its subscriptions
pub struct Consumer {
    name: String,
    subscribe_tx: ChannelSender<Subscription<Packet>>,
    waker: Unparker,
    stats: Arc<ConsumerStats>,
    worker: Worker,
}

impl Consumer {
    /// Start polling for `component`. With nothing ready on any ring the
    /// thread parks for at most `idle_park`, or until a producer commits.
    pub fn spawn<C: Consume>(
        name: impl Into<String>,
        idle_park: Duration,
        mut component: C,
    ) -> Result<Self, MediaError> {
        let name = name.into();
        let (subscribe_tx, subscribe_rx) = unbounded::<Subscription<Packet>>();
        let parker = Parker::new();
        let waker = parker.unparker().clone();
        let stats = Arc::new(ConsumerStats::default());
        let stats_for_loop = stats.clone();
        let interest = component.interest();
        let mut subscriptions: Vec<Subscription<Packet>> = Vec::new();

        let worker = Worker::spawn(name.clone(), Schedule::Continuous, move || {
            subscriptions.extend(subscribe_rx.try_iter());

            let mut progressed = false;
            for subscription in &subscriptions {
                let Some(slot) = subscription.acquire() else {
                    continue;
                };
                progressed = true;

                if interest.matches(slot.kind_bits()) {
                    component.consume(&slot);
                    stats_for_loop.consumed.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats_for_loop.filtered.fetch_add(1, Ordering::Relaxed);
                }
                drop(slot);
                // Release even when filtered so the ticket never holds the producer back
                subscription.release();
            }

            if !progressed {
                parker.park_timeout(idle_park);
            }
        })?;

        tracing::debug!(consumer = %name, interest = interest.bits(), "Consumer started");

        Ok(Self {
            name,
            subscribe_tx,
            waker,
            stats,
            worker,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start consuming `ring`; the new ticket starts up to one ring behind
    pub fn subscribe(&self, ring: &Arc<PacketRing>) {
        let subscription = ring.subscribe_with_waker(self.waker.clone());
        if self.subscribe_tx.send(subscription).is_ok() {
            self.stats.subscriptions.fetch_add(1, Ordering::Relaxed);
            self.waker.unpark();
        }
    }

    pub fn subscribe_to(&self, producer: &Producer) {
        self.subscribe(producer.ring());
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }

    /// Stop polling; dropping the thread's subscriptions unregisters every ticket
    pub fn stop(&mut self) {
        self.worker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{RingBuffer, StallPolicy};
    use crate::packet::{Origin, PacketKind};
    use parking_lot::Mutex;
    use std::time::Instant;

    struct Collect {
        seen: Arc<Mutex<Vec<(PacketKind, u8)>>>,
    }

    impl Consume for Collect {
        fn interest(&self) -> KindMask {
            KindMask::AUDIO
        }

        fn consume(&mut self, packet: &Packet) {
            let kind = packet.kind().unwrap();
            self.seen.lock().push((kind, packet.payload()[0]));
        }
    }

    fn publish(writer: &mut crate::buffer::RingWriter<Packet>, kind: PacketKind, value: u8) {
        let mut slot = writer.claim().unwrap();
        slot.prepare(1)[0] = value;
        slot.set_kind(kind).set_origin(Origin(1));
        slot.commit();
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_filtered_packets_still_release() {
        let (ring, mut writer) = RingBuffer::new(2, StallPolicy::Block, Packet::default).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumer = Consumer::spawn(
            "test-collect",
            Duration::from_millis(5),
            Collect { seen: seen.clone() },
        )
        .unwrap();
        consumer.subscribe(&ring);
        assert!(wait_for(Duration::from_secs(2), || ring.subscriber_count() == 1));

        // More video than the ring holds: only passes if filtered slots are released
        for value in 0..8 {
            publish(&mut writer, PacketKind::Video, value);
        }
        publish(&mut writer, PacketKind::Audio, 42);

        assert!(wait_for(Duration::from_secs(2), || seen.lock().len() == 1));
        assert_eq!(seen.lock()[0], (PacketKind::Audio, 42));
        assert_eq!(consumer.stats().filtered(), 8);

        consumer.stop();
        assert_eq!(ring.subscriber_count(), 0);
    }

    #[test]
    fn test_polls_several_rings() {
        let (first, mut first_writer) = RingBuffer::new(4, StallPolicy::Block, Packet::default).unwrap();
        let (second, mut second_writer) = RingBuffer::new(4, StallPolicy::Block, Packet::default).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = Consumer::spawn(
            "test-multi",
            Duration::from_millis(5),
            Collect { seen: seen.clone() },
        )
        .unwrap();
        consumer.subscribe(&first);
        consumer.subscribe(&second);
        assert!(wait_for(Duration::from_secs(2), || {
            first.subscriber_count() == 1 && second.subscriber_count() == 1
        }));

        for value in 0..3 {
            publish(&mut first_writer, PacketKind::Audio, value);
            publish(&mut second_writer, PacketKind::Audio, 100 + value);
        }

        assert!(wait_for(Duration::from_secs(2), || seen.lock().len() == 6));
        let seen = seen.lock();
        let from_first: Vec<u8> = seen.iter().map(|(_, v)| *v).filter(|v| *v < 100).collect();
        let from_second: Vec<u8> = seen.iter().map(|(_, v)| *v).filter(|v| *v >= 100).collect();
        // FIFO within each ring, arbitrary interleaving across rings
        assert_eq!(from_first, vec![0, 1, 2]);
        assert_eq!(from_second, vec![100, 101, 102]);
    }
}
