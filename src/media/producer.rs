//! Producer driver: one ring, one worker thread

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::{RingBuffer, RingWriter, Subscription};
use crate::config::RingConfig;
use crate::error::Result;
use crate::packet::Packet;
use crate::worker::{Schedule, Worker};

/// Ring of pooled packets owned by a producer
pub type PacketRing = RingBuffer<Packet>;

/// What one `produce` step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Produced {
    /// One packet of `bytes` wire bytes was committed
    Committed { bytes: usize },
    /// Nothing to publish this step
    Nothing,
}

/// A component that fills ring slots
pub trait Produce: Send + 'static {
    /// Claim, fill and commit at most one slot
    fn produce(&mut self, writer: &mut RingWriter<Packet>) -> Result<Produced>;
}

/// Producer counters
#[derive(Debug, Default)]
pub struct ProducerStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub errors: AtomicU64,
}

impl ProducerStats {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// A running producer: its ring and the thread that feeds it
pub struct Producer {
    name: String,
    ring: Arc<PacketRing>,
    stats: Arc<ProducerStats>,
    worker: Worker,
}

impl Producer {
    /// Allocate the ring and start driving `component` on `schedule`
    pub fn spawn<P: Produce>(
        name: impl Into<String>,
        schedule: Schedule,
        ring_config: &RingConfig,
        mut component: P,
    ) -> Result<Self> {
        let name = name.into();
        let (ring, mut writer) = RingBuffer::new(
            ring_config.capacity,
            ring_config.stall_policy(),
            Packet::factory(ring_config.packet_capacity),
        )?;

        let stats = Arc::new(ProducerStats::default());
        let stats_for_loop = stats.clone();
        let name_for_loop = name.clone();

        let worker = Worker::spawn(name.clone(), schedule, move || {
            match component.produce(&mut writer) {
                Ok(Produced::Committed { bytes }) => {
                    stats_for_loop.packets.fetch_add(1, Ordering::Relaxed);
                    stats_for_loop.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                }
                Ok(Produced::Nothing) => {}
                Err(e) => {
                    // Count every failure, log the first and then every hundredth
                    let errors = stats_for_loop.errors.fetch_add(1, Ordering::Relaxed);
                    if errors % 100 == 0 {
                        tracing::warn!(producer = %name_for_loop, error = %e, errors = errors + 1, "Produce failed");
                    }
                }
            }
        })?;

        tracing::info!(producer = %name, capacity = ring.capacity(), ?schedule, "Producer started");

        Ok(Self {
            name,
            ring,
            stats,
            worker,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring(&self) -> &Arc<PacketRing> {
        &self.ring
    }

    /// Register a bare ticket on this producer's ring
    pub fn subscribe(&self) -> Subscription<Packet> {
        self.ring.subscribe()
    }

    pub fn stats(&self) -> &Arc<ProducerStats> {
        &self.stats
    }

    /// Stop the worker; a step blocked in `claim` is released by closing the ring
    pub fn stop(&mut self) {
        self.ring.close();
        self.worker.stop();
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Origin, PacketKind};
    use std::time::{Duration, Instant};

    struct Counter {
        next: u32,
    }

    impl Produce for Counter {
        fn produce(&mut self, writer: &mut RingWriter<Packet>) -> Result<Produced> {
            let mut slot = writer.claim()?;
            slot.prepare(4).copy_from_slice(&self.next.to_le_bytes());
            slot.set_kind(PacketKind::Audio).set_origin(Origin(7));
            let bytes = slot.capacity();
            slot.commit();
            self.next += 1;
            Ok(Produced::Committed { bytes })
        }
    }

    #[test]
    fn test_producer_fills_ring_in_order() {
        let config = RingConfig {
            capacity: 8,
            stall_timeout_ms: 0,
            ..RingConfig::default()
        };
        let mut producer =
            Producer::spawn("test-counter", Schedule::Continuous, &config, Counter { next: 0 }).unwrap();
        let sub = producer.subscribe();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while seen.len() < 32 && Instant::now() < deadline {
            if let Some(slot) = sub.acquire() {
                let value = u32::from_le_bytes(slot.payload().try_into().unwrap());
                drop(slot);
                sub.release();
                seen.push(value);
            }
        }
        producer.stop();

        assert!(producer.ring().is_closed());
        assert_eq!(seen.len(), 32);
        // The subscription may start up to one ring behind; after that no gaps
        assert!(seen.windows(2).all(|pair| pair[1] == pair[0] + 1), "{:?}", seen);
        assert!(producer.stats().packets() >= 32);
    }
}
