//! Network receive producer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::producer::{Produce, Produced};
use crate::buffer::RingWriter;
use crate::config::NetworkConfig;
use crate::error::Result;
use crate::network::{DatagramSource, Inbound, MAX_DATAGRAM_SIZE};
use crate::packet::{Packet, PacketView};

/// Receiver counters
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub datagrams: AtomicU64,
    pub malformed: AtomicU64,
    pub reconnects: AtomicU64,
}

impl ReceiverStats {
    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Continuous producer fed by the media transport.
///
/// Each inbound datagram becomes one packet with its kind taken from the
/// wire trailer. Losing every peer triggers close, reopen and back-off
/// without surfacing an error.
pub struct Receiver<S: DatagramSource> {
    source: S,
    scratch: Vec<u8>,
    poll_timeout: Duration,
    backoff: Duration,
    stats: Arc<ReceiverStats>,
}

impl<S: DatagramSource> Receiver<S> {
    pub fn new(source: S, config: &NetworkConfig) -> Self {
        Self {
            source,
            scratch: vec![0u8; MAX_DATAGRAM_SIZE],
            poll_timeout: config.receive_poll(),
            backoff: config.reconnect_backoff(),
            stats: Arc::new(ReceiverStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    fn reconnect(&mut self) {
        let addr = self.source.local_addr();
        match self.source.reopen() {
            Ok(()) => tracing::info!(%addr, "No reachable peers, endpoint reopened"),
            Err(e) => tracing::warn!(%addr, error = %e, "Failed to reopen endpoint"),
        }
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        std::thread::sleep(self.backoff);
    }
}

impl<S: DatagramSource> Produce for Receiver<S> {
    fn produce(&mut self, writer: &mut RingWriter<Packet>) -> Result<Produced> {
        match self.source.poll(&mut self.scratch, self.poll_timeout)? {
            Inbound::Datagram { len, from } => {
                self.stats.datagrams.fetch_add(1, Ordering::Relaxed);
                let bytes = &self.scratch[..len];

                if let Err(e) = PacketView::parse(bytes) {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%from, len, error = %e, "Dropping malformed datagram");
                    return Ok(Produced::Nothing);
                }

                let mut slot = writer.claim()?;
                slot.copy_from_wire(bytes)?;
                slot.commit();
                Ok(Produced::Committed { bytes: len })
            }
            Inbound::Idle => Ok(Produced::Nothing),
            Inbound::NoPeers => {
                self.reconnect();
                Ok(Produced::Nothing)
            }
        }
    }
}
