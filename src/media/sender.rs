//! Outbound media consumer

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::consumer::Consume;
use crate::network::{DatagramSink, Destinations};
use crate::packet::{KindMask, Packet};

/// Sender counters
#[derive(Debug, Default)]
pub struct SenderStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
}

impl SenderStats {
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// Forwards every media packet verbatim to the current destination set.
///
/// The set is shared with the call controller and may change between two
/// packets; each packet goes to a snapshot taken just before sending.
pub struct Sender<K: DatagramSink> {
    sink: K,
    destinations: Destinations,
    /// Reused destination snapshot
    targets: Vec<SocketAddr>,
    stats: Arc<SenderStats>,
}

impl<K: DatagramSink + 'static> Sender<K> {
    pub fn new(sink: K, destinations: Destinations) -> Self {
        Self {
            sink,
            destinations,
            targets: Vec::new(),
            stats: Arc::new(SenderStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SenderStats> {
        self.stats.clone()
    }

    /// Best-effort send of `bytes` to every destination
    pub fn send_to_all(&mut self, bytes: &[u8]) {
        self.destinations.snapshot_into(&mut self.targets);

        for dest in &self.targets {
            match self.sink.send_to(bytes, *dest) {
                Ok(sent) => {
                    self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    let errors = self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    if errors % 100 == 0 {
                        tracing::warn!(%dest, error = %e, errors = errors + 1, "Send failed");
                    }
                }
            }
        }
    }
}

impl<K: DatagramSink + 'static> Consume for Sender<K> {
    fn interest(&self) -> KindMask {
        KindMask::MEDIA
    }

    fn consume(&mut self, packet: &Packet) {
        self.send_to_all(packet.as_bytes());
    }
}
