//! Media transport boundary
//!
//! The media path is unreliable datagram delivery. Producers poll a
//! [`DatagramSource`]; the sender fans packets out through a
//! [`DatagramSink`] to every address in a shared [`Destinations`] set.

pub mod memory;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;

use crate::error::NetworkError;

pub use memory::{MemoryNetwork, MemorySink, MemorySource};
pub use udp::{UdpConfig, UdpSink, UdpSource};

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Outcome of one receive poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// `len` bytes were written to the front of the caller's buffer
    Datagram { len: usize, from: SocketAddr },
    /// Nothing arrived within the poll timeout
    Idle,
    /// No remote peer is reachable; the endpoint should be reopened
    NoPeers,
}

/// Inbound half of the media transport
pub trait DatagramSource: Send + 'static {
    /// Wait up to `timeout` for one datagram
    fn poll(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Inbound, NetworkError>;

    /// Close the local endpoint and open a fresh one on the same address
    fn reopen(&mut self) -> Result<(), NetworkError>;

    fn local_addr(&self) -> SocketAddr;
}

/// Outbound half of the media transport
pub trait DatagramSink: Send + Sync {
    /// Best-effort delivery of one datagram
    fn send_to(&self, bytes: &[u8], destination: SocketAddr) -> Result<usize, NetworkError>;
}

impl<S: DatagramSink + ?Sized> DatagramSink for Arc<S> {
    fn send_to(&self, bytes: &[u8], destination: SocketAddr) -> Result<usize, NetworkError> {
        (**self).send_to(bytes, destination)
    }
}

/// Concurrent set of media destinations.
///
/// Written by the call controller while the sender's poll thread reads it;
/// clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct Destinations {
    inner: Arc<DashSet<SocketAddr>>,
}

impl Destinations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the address was not already present
    pub fn insert(&self, addr: SocketAddr) -> bool {
        self.inner.insert(addr)
    }

    pub fn remove(&self, addr: &SocketAddr) -> bool {
        self.inner.remove(addr).is_some()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.inner.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Copy the current set into `out`, replacing its contents
    pub fn snapshot_into(&self, out: &mut Vec<SocketAddr>) {
        out.clear();
        out.extend(self.inner.iter().map(|addr| *addr));
    }

    pub fn snapshot(&self) -> Vec<SocketAddr> {
        let mut out = Vec::with_capacity(self.len());
        self.snapshot_into(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destinations_are_shared_between_clones() {
        let destinations = Destinations::new();
        let reader = destinations.clone();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        assert!(destinations.insert(addr));
        assert!(!destinations.insert(addr));
        assert!(reader.contains(&addr));
        assert_eq!(reader.snapshot(), vec![addr]);

        assert!(destinations.remove(&addr));
        assert!(reader.is_empty());
    }
}
