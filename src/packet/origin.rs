//! Peer identifiers carried in the packet trailer

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use crate::error::Error;

/// Opaque 64-bit peer identifier.
///
/// IPv4 peers are encoded as `ip << 16 | port`, which leaves the top 16 bits
/// clear. Values with any of those bits set are session-assigned addresses
/// and have no socket form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Origin(pub u64);

impl Origin {
    /// Origin used before a packet has been stamped
    pub const UNSET: Origin = Origin(0);

    /// Encode an IPv4 socket address
    pub fn from_v4(addr: SocketAddrV4) -> Self {
        Origin((u64::from(u32::from(*addr.ip())) << 16) | u64::from(addr.port()))
    }

    /// Encode a socket address. IPv6 has no 48-bit form.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self::from_v4(v4)),
            SocketAddr::V6(_) => None,
        }
    }

    /// Decode back into a socket address, if this is an address-derived origin
    pub fn to_socket_addr(self) -> Option<SocketAddr> {
        if self.0 >> 48 != 0 {
            return None;
        }
        let ip = Ipv4Addr::from((self.0 >> 16) as u32);
        let port = self.0 as u16;
        Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<SocketAddrV4> for Origin {
    fn from(addr: SocketAddrV4) -> Self {
        Self::from_v4(addr)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "#{:016x}", self.0),
        }
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddrV4 = s
            .parse()
            .map_err(|_| Error::Config(format!("Invalid peer address: {}", s)))?;
        Ok(Self::from_v4(addr))
    }
}
