//! Error types for the media mesh

use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Ring buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Packet decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Buffer too small for trailer: {0} bytes")]
    TooShort(usize),

    #[error("Payload length {length} exceeds addressable region of {addressable} bytes")]
    LengthOutOfBounds { length: usize, addressable: usize },

    #[error("Unknown packet kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Expected a {expected} packet")]
    UnexpectedKind { expected: &'static str },

    #[error("Member list is not a multiple of 8 bytes: {0}")]
    MemberList(usize),
}

/// Ring buffer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("Slot {0} is still held by a reader")]
    SlotBusy(u64),

    #[error("Invalid ring capacity: {0} (must be a power of two >= 2)")]
    InvalidCapacity(usize),

    #[error("Ring is closed")]
    Closed,
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Datagram too large: {0} bytes")]
    DatagramTooLarge(usize),

    #[error("Endpoint {0} is closed")]
    Closed(SocketAddr),
}

/// Control-plane errors
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Could not reach {addr}: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Request to {0} timed out")]
    Timeout(SocketAddr),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Malformed reply: {0}")]
    Malformed(#[from] PacketError),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("{0} is not in a call")]
    Rejected(SocketAddr),

    #[error("Signaling IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Call membership errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call hosted by {0}")]
    AlreadyInCall(String),

    #[error("Not in a call")]
    NotInCall,

    #[error("Address {0} cannot be used as a peer origin")]
    UnsupportedAddress(SocketAddr),
}

/// Device-boundary errors (capture, playback, codecs)
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Image encoding failed: {0}")]
    Encode(String),

    #[error("Worker thread failed to start: {0}")]
    Spawn(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
