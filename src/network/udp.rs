//! UDP media transport built on socket2

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::{DatagramSink, DatagramSource, Inbound, MAX_DATAGRAM_SIZE};
use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Socket options shared by both halves
#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Silence longer than this is reported as [`Inbound::NoPeers`]
    pub liveness_timeout: Duration,
}

impl From<&NetworkConfig> for UdpConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            recv_buffer_size: config.recv_buffer_size,
            send_buffer_size: config.send_buffer_size,
            liveness_timeout: config.liveness_timeout(),
        }
    }
}

fn create_socket(addr: SocketAddr, config: &UdpConfig) -> Result<UdpSocket, NetworkError> {
    let bind_failed = |source: io::Error| NetworkError::BindFailed { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_failed)?;
    socket.set_reuse_address(true).map_err(bind_failed)?;

    // Buffer sizes are advisory; the OS may clamp or refuse them
    if config.recv_buffer_size > 0 {
        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
            tracing::warn!(%addr, error = %e, "Could not set receive buffer size");
        }
    }
    if config.send_buffer_size > 0 {
        if let Err(e) = socket.set_send_buffer_size(config.send_buffer_size) {
            tracing::warn!(%addr, error = %e, "Could not set send buffer size");
        }
    }

    socket.bind(&addr.into()).map_err(bind_failed)?;
    Ok(socket.into())
}

/// Receiving endpoint bound to the peer's media address
pub struct UdpSource {
    addr: SocketAddr,
    /// `None` between closing and rebinding
    socket: Option<UdpSocket>,
    config: UdpConfig,
    last_datagram: Instant,
}

impl UdpSource {
    pub fn bind(addr: SocketAddr, config: UdpConfig) -> Result<Self, NetworkError> {
        let socket = create_socket(addr, &config)?;
        // Pin an ephemeral port so reopening rebinds the same one
        let addr = socket.local_addr().unwrap_or(addr);
        tracing::info!(%addr, "UDP source bound");

        Ok(Self {
            addr,
            socket: Some(socket),
            config,
            last_datagram: Instant::now(),
        })
    }

    fn quiet(&self) -> Inbound {
        if self.last_datagram.elapsed() >= self.config.liveness_timeout {
            Inbound::NoPeers
        } else {
            Inbound::Idle
        }
    }
}

impl DatagramSource for UdpSource {
    fn poll(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Inbound, NetworkError> {
        // A zero read timeout means "block forever" to the OS
        let timeout = timeout.max(Duration::from_millis(1));
        // A failed rebind leaves no socket; the receiver retries the reopen
        let Some(socket) = self.socket.as_ref() else {
            return Ok(Inbound::NoPeers);
        };
        socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

        match socket.recv_from(buf) {
            Ok((len, from)) => {
                self.last_datagram = Instant::now();
                Ok(Inbound::Datagram { len, from })
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(self.quiet())
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(Inbound::NoPeers),
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }

    /// Close the socket, then bind a fresh one on the same address
    fn reopen(&mut self) -> Result<(), NetworkError> {
        drop(self.socket.take());
        self.socket = Some(create_socket(self.addr, &self.config)?);
        self.last_datagram = Instant::now();
        tracing::debug!(addr = %self.addr, "UDP source reopened");
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Sending endpoint on an ephemeral port of the peer's interface
pub struct UdpSink {
    socket: UdpSocket,
}

impl UdpSink {
    pub fn bind(local: SocketAddr, config: UdpConfig) -> Result<Self, NetworkError> {
        let addr = SocketAddr::new(local.ip(), 0);
        let socket = create_socket(addr, &config)?;
        tracing::debug!(addr = ?socket.local_addr().ok(), "UDP sink bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

impl DatagramSink for UdpSink {
    fn send_to(&self, bytes: &[u8], destination: SocketAddr) -> Result<usize, NetworkError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(NetworkError::DatagramTooLarge(bytes.len()));
        }
        self.socket
            .send_to(bytes, destination)
            .map_err(|e| NetworkError::SendFailed(format!("{}: {}", destination, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(liveness_ms: u64) -> UdpConfig {
        UdpConfig {
            recv_buffer_size: 0,
            send_buffer_size: 0,
            liveness_timeout: Duration::from_millis(liveness_ms),
        }
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_datagram_round_trip() {
        let mut source = UdpSource::bind(localhost(), config(1000)).unwrap();
        let sink = UdpSink::bind(localhost(), config(1000)).unwrap();

        sink.send_to(b"hello", source.local_addr()).unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut received = None;
        for _ in 0..50 {
            if let Inbound::Datagram { len, from } = source.poll(&mut buf, Duration::from_millis(20)).unwrap() {
                received = Some((buf[..len].to_vec(), from));
                break;
            }
        }
        let (bytes, from) = received.expect("datagram not received");
        assert_eq!(bytes, b"hello");
        assert_eq!(Some(from), sink.local_addr());
    }

    #[test]
    fn test_silence_reports_no_peers_and_reopen_keeps_port() {
        let mut source = UdpSource::bind(localhost(), config(30)).unwrap();
        let addr = source.local_addr();
        let mut buf = [0u8; 64];

        assert_eq!(source.poll(&mut buf, Duration::from_millis(5)).unwrap(), Inbound::Idle);
        let mut outcome = Inbound::Idle;
        for _ in 0..20 {
            outcome = source.poll(&mut buf, Duration::from_millis(10)).unwrap();
            if outcome == Inbound::NoPeers {
                break;
            }
        }
        assert_eq!(outcome, Inbound::NoPeers);

        source.reopen().unwrap();
        assert_eq!(source.local_addr(), addr);
        assert_eq!(source.poll(&mut buf, Duration::from_millis(5)).unwrap(), Inbound::Idle);
    }

    #[test]
    fn test_reopened_source_still_receives() {
        let mut source = UdpSource::bind(localhost(), config(1000)).unwrap();
        let addr = source.local_addr();
        source.reopen().unwrap();
        source.reopen().unwrap();
        assert_eq!(source.local_addr(), addr);

        let sink = UdpSink::bind(localhost(), config(1000)).unwrap();
        sink.send_to(b"again", addr).unwrap();
        let mut buf = [0u8; 64];
        let mut received = false;
        for _ in 0..50 {
            if let Inbound::Datagram { len, .. } = source.poll(&mut buf, Duration::from_millis(20)).unwrap() {
                assert_eq!(&buf[..len], b"again");
                received = true;
                break;
            }
        }
        assert!(received);
    }

    #[test]
    fn test_oversized_datagram_is_rejected() {
        let sink = UdpSink::bind(localhost(), config(1000)).unwrap();
        let bytes = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            sink.send_to(&bytes, "127.0.0.1:9".parse().unwrap()),
            Err(NetworkError::DatagramTooLarge(_))
        ));
    }
}
