//! In-process datagram hub
//!
//! Stands in for the LAN when several peers run inside one process. Every
//! bound source gets a channel keyed by its address; sinks look the address
//! up at send time. A reachability switch simulates losing every remote peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{DatagramSink, DatagramSource, Inbound};
use crate::error::NetworkError;

/// Datagrams queued per endpoint before new ones are dropped
const ENDPOINT_QUEUE: usize = 1024;

struct Endpoint {
    generation: u64,
    tx: Sender<(Vec<u8>, SocketAddr)>,
}

struct Hub {
    endpoints: DashMap<SocketAddr, Endpoint>,
    reachable: AtomicBool,
    next_generation: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Shared handle to the hub; clones refer to the same network
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                endpoints: DashMap::new(),
                reachable: AtomicBool::new(true),
                next_generation: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Open a receiving endpoint at `addr`
    pub fn bind(&self, addr: SocketAddr) -> Result<MemorySource, NetworkError> {
        let (generation, rx) = self.register(addr)?;
        Ok(MemorySource {
            addr,
            network: self.clone(),
            generation,
            rx,
        })
    }

    /// Sending half stamped with `from`
    pub fn sink(&self, from: SocketAddr) -> MemorySink {
        MemorySink {
            from,
            network: self.clone(),
        }
    }

    /// While unreachable, sends are dropped and sources report `NoPeers`
    pub fn set_reachable(&self, reachable: bool) {
        self.hub.reachable.store(reachable, Ordering::SeqCst);
        tracing::info!(reachable, "Memory network reachability changed");
    }

    pub fn is_reachable(&self) -> bool {
        self.hub.reachable.load(Ordering::SeqCst)
    }

    /// Number of endpoints currently bound
    pub fn open_endpoints(&self) -> usize {
        self.hub.endpoints.len()
    }

    pub fn delivered(&self) -> u64 {
        self.hub.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.hub.dropped.load(Ordering::Relaxed)
    }

    fn register(&self, addr: SocketAddr) -> Result<(u64, Receiver<(Vec<u8>, SocketAddr)>), NetworkError> {
        let (tx, rx) = bounded(ENDPOINT_QUEUE);
        let generation = self.hub.next_generation.fetch_add(1, Ordering::Relaxed);

        match self.hub.endpoints.entry(addr) {
            Entry::Occupied(_) => Err(NetworkError::BindFailed {
                addr,
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Endpoint { generation, tx });
                Ok((generation, rx))
            }
        }
    }

    fn unregister(&self, addr: SocketAddr, generation: u64) {
        self.hub
            .endpoints
            .remove_if(&addr, |_, endpoint| endpoint.generation == generation);
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving endpoint; unbinds on drop
pub struct MemorySource {
    addr: SocketAddr,
    network: MemoryNetwork,
    generation: u64,
    rx: Receiver<(Vec<u8>, SocketAddr)>,
}

impl DatagramSource for MemorySource {
    fn poll(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Inbound, NetworkError> {
        if !self.network.is_reachable() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
            return Ok(Inbound::NoPeers);
        }

        match self.rx.recv_timeout(timeout) {
            Ok((bytes, from)) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(Inbound::Datagram { len, from })
            }
            Err(RecvTimeoutError::Timeout) => Ok(Inbound::Idle),
            Err(RecvTimeoutError::Disconnected) => Err(NetworkError::Closed(self.addr)),
        }
    }

    fn reopen(&mut self) -> Result<(), NetworkError> {
        self.network.unregister(self.addr, self.generation);
        let (generation, rx) = self.network.register(self.addr)?;
        self.generation = generation;
        self.rx = rx;
        tracing::debug!(addr = %self.addr, "Memory source reopened");
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.network.unregister(self.addr, self.generation);
    }
}

/// Sending half; unknown destinations are silently dropped like UDP
pub struct MemorySink {
    from: SocketAddr,
    network: MemoryNetwork,
}

impl DatagramSink for MemorySink {
    fn send_to(&self, bytes: &[u8], destination: SocketAddr) -> Result<usize, NetworkError> {
        let hub = &self.network.hub;
        if !hub.reachable.load(Ordering::SeqCst) {
            hub.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        }

        let Some(endpoint) = hub.endpoints.get(&destination) else {
            hub.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        };

        match endpoint.tx.try_send((bytes.to_vec(), self.from)) {
            Ok(()) => {
                hub.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(bytes.len())
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                hub.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(0)
            }
        }
    }
}
