//! Self-describing media/control packet
//!
//! A packet is a byte buffer with a fixed-size metadata trailer packed at
//! `capacity - TRAILER_SIZE`:
//!
//! ```text
//! [ payload ... ][ padding to 8 ][ kind:u8 ][ payload_len:u32 LE ][ origin:u64 LE ][ timestamp:u64 LE ]
//! ```
//!
//! Because the trailer hangs off the end, a producer can size the buffer for
//! its payload first and fill the metadata afterwards. Packets live in ring
//! buffer slots and are reused; `prepare` grows the buffer only when a payload
//! is larger than anything the slot carried before.

pub mod control;
pub mod origin;

use std::ops::BitOr;
use std::sync::OnceLock;
use std::time::Instant;

use bytes::{Buf, BufMut};

use crate::error::PacketError;

pub use control::ControlMessage;
pub use origin::Origin;

/// Size of the metadata trailer in bytes
pub const TRAILER_SIZE: usize = 1 + 4 + 8 + 8;

/// Payloads are padded to this boundary
pub const ALIGNMENT: usize = 8;

/// Round `len` up to the payload alignment
#[inline]
pub fn align(len: usize) -> usize {
    (len + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Monotonic producer-side clock in nanoseconds.
///
/// Only meaningful for latency measurement between packets stamped in the
/// same process.
pub fn timestamp_now() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Packet kinds, one bit each so that filters can be unions of kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Audio = 0b1000_0000,
    Video = 0b0100_0000,
    Join = 0b0010_0000,
    JoinReply = 0b0001_0000,
    Leave = 0b0000_1000,
}

impl PacketKind {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b1000_0000 => Some(PacketKind::Audio),
            0b0100_0000 => Some(PacketKind::Video),
            0b0010_0000 => Some(PacketKind::Join),
            0b0001_0000 => Some(PacketKind::JoinReply),
            0b0000_1000 => Some(PacketKind::Leave),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn is_media(self) -> bool {
        matches!(self, PacketKind::Audio | PacketKind::Video)
    }
}

/// Set of packet kinds a consumer is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KindMask(u8);

impl KindMask {
    pub const NONE: KindMask = KindMask(0);
    pub const AUDIO: KindMask = KindMask(PacketKind::Audio as u8);
    pub const VIDEO: KindMask = KindMask(PacketKind::Video as u8);
    pub const MEDIA: KindMask = KindMask(PacketKind::Audio as u8 | PacketKind::Video as u8);
    pub const CONTROL: KindMask = KindMask(
        PacketKind::Join as u8 | PacketKind::JoinReply as u8 | PacketKind::Leave as u8,
    );
    pub const ALL: KindMask = KindMask(0xff);

    pub const fn from_bits(bits: u8) -> Self {
        KindMask(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if any bit of `kind_bits` is in the mask
    #[inline]
    pub fn matches(self, kind_bits: u8) -> bool {
        self.0 & kind_bits != 0
    }
}

impl From<PacketKind> for KindMask {
    fn from(kind: PacketKind) -> Self {
        KindMask(kind.bits())
    }
}

impl BitOr for KindMask {
    type Output = KindMask;

    fn bitor(self, rhs: KindMask) -> KindMask {
        KindMask(self.0 | rhs.0)
    }
}

impl BitOr<PacketKind> for KindMask {
    type Output = KindMask;

    fn bitor(self, rhs: PacketKind) -> KindMask {
        KindMask(self.0 | rhs.bits())
    }
}

// Trailer field offsets relative to `capacity - TRAILER_SIZE`
const KIND_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = 1;
const ORIGIN_OFFSET: usize = 5;
const TIMESTAMP_OFFSET: usize = 13;

/// Pooled packet buffer
#[derive(Clone)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Create a packet of `capacity` bytes (at least `TRAILER_SIZE`)
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(TRAILER_SIZE)],
        }
    }

    /// Slot factory for ring buffers
    pub fn factory(capacity: usize) -> impl Fn() -> Packet {
        move || Packet::new(capacity)
    }

    /// Total buffer size, trailer included
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes usable for payload (`capacity - TRAILER_SIZE`)
    pub fn addressable(&self) -> usize {
        self.buf.len() - TRAILER_SIZE
    }

    /// Size the buffer for a payload of `payload_len` bytes and return the
    /// payload region.
    ///
    /// Any existing payload prefix is preserved; padding and trailer are
    /// zeroed and `payload_len` is recorded. The allocation is reused when it
    /// is already large enough.
    pub fn prepare(&mut self, payload_len: usize) -> &mut [u8] {
        let capacity = align(payload_len) + TRAILER_SIZE;
        self.buf.resize(capacity, 0);
        self.buf[payload_len..].fill(0);
        self.set_payload_len(payload_len);
        &mut self.buf[..payload_len]
    }

    /// Replace the whole buffer with wire bytes received from a peer
    pub fn copy_from_wire(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        PacketView::parse(bytes)?;
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn trailer(&self) -> &[u8] {
        &self.buf[self.buf.len() - TRAILER_SIZE..]
    }

    fn trailer_mut(&mut self) -> &mut [u8] {
        let start = self.buf.len() - TRAILER_SIZE;
        &mut self.buf[start..]
    }

    pub fn kind_bits(&self) -> u8 {
        self.trailer()[KIND_OFFSET]
    }

    pub fn kind(&self) -> Option<PacketKind> {
        PacketKind::from_bits(self.kind_bits())
    }

    pub fn payload_len(&self) -> usize {
        (&self.trailer()[LENGTH_OFFSET..]).get_u32_le() as usize
    }

    pub fn origin(&self) -> Origin {
        Origin((&self.trailer()[ORIGIN_OFFSET..]).get_u64_le())
    }

    pub fn timestamp(&self) -> u64 {
        (&self.trailer()[TIMESTAMP_OFFSET..]).get_u64_le()
    }

    pub fn set_kind(&mut self, kind: PacketKind) -> &mut Self {
        self.trailer_mut()[KIND_OFFSET] = kind.bits();
        self
    }

    /// Record the logical payload length, clamped to the addressable region
    pub fn set_payload_len(&mut self, len: usize) -> &mut Self {
        debug_assert!(len <= self.addressable(), "payload length beyond trailer");
        let len = len.min(self.addressable()) as u32;
        (&mut self.trailer_mut()[LENGTH_OFFSET..]).put_u32_le(len);
        self
    }

    pub fn set_origin(&mut self, origin: Origin) -> &mut Self {
        (&mut self.trailer_mut()[ORIGIN_OFFSET..]).put_u64_le(origin.0);
        self
    }

    pub fn set_timestamp(&mut self, timestamp: u64) -> &mut Self {
        (&mut self.trailer_mut()[TIMESTAMP_OFFSET..]).put_u64_le(timestamp);
        self
    }

    /// Logical payload (never reaches into padding or trailer)
    pub fn payload(&self) -> &[u8] {
        let len = self.payload_len().min(self.addressable());
        &self.buf[..len]
    }

    /// Whole wire representation, padding and trailer included
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Zero-copy validated view of this packet
    pub fn view(&self) -> Result<PacketView<'_>, PacketError> {
        PacketView::parse(&self.buf)
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new(TRAILER_SIZE)
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind())
            .field("payload_len", &self.payload_len())
            .field("origin", &self.origin())
            .field("timestamp", &self.timestamp())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Borrowed, validated decoding of a packet's wire bytes
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub kind: PacketKind,
    pub origin: Origin,
    pub timestamp: u64,
    pub payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// Decode the trailer of `bytes` without copying the payload
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        if bytes.len() < TRAILER_SIZE {
            return Err(PacketError::TooShort(bytes.len()));
        }
        let addressable = bytes.len() - TRAILER_SIZE;
        let mut trailer = &bytes[addressable..];

        let kind_bits = trailer.get_u8();
        let length = trailer.get_u32_le() as usize;
        let origin = Origin(trailer.get_u64_le());
        let timestamp = trailer.get_u64_le();

        let kind = PacketKind::from_bits(kind_bits).ok_or(PacketError::UnknownKind(kind_bits))?;
        if length > addressable {
            return Err(PacketError::LengthOutOfBounds { length, addressable });
        }

        Ok(Self {
            kind,
            origin,
            timestamp,
            payload: &bytes[..length],
        })
    }

    /// Decode once into the tagged message shape
    pub fn message(&self) -> Result<Message<'a>, PacketError> {
        match self.kind {
            PacketKind::Audio => Ok(Message::Media {
                kind: MediaKind::Audio,
                origin: self.origin,
                timestamp: self.timestamp,
                payload: self.payload,
            }),
            PacketKind::Video => Ok(Message::Media {
                kind: MediaKind::Video,
                origin: self.origin,
                timestamp: self.timestamp,
                payload: self.payload,
            }),
            _ => ControlMessage::decode(self).map(Message::Control),
        }
    }
}

/// Media flavours carried on the unreliable path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// A packet decoded into its logical shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    Media {
        kind: MediaKind,
        origin: Origin,
        timestamp: u64,
        payload: &'a [u8],
    },
    Control(ControlMessage),
}
