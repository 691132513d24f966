//! Call-membership control messages
//!
//! Control messages share the packet wire format with media. The trailer's
//! origin field names the sender; `JOIN_REPLY` additionally carries the
//! membership as a flat list of little-endian `u64` origins in its payload.

use bytes::{Buf, BufMut};

use super::{timestamp_now, Origin, Packet, PacketKind, PacketView};
use crate::error::PacketError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `origin` asks to join the receiver's call
    Join { origin: Origin },
    /// Current membership of `host`'s call; empty when the sender is not in a call
    JoinReply { host: Origin, members: Vec<Origin> },
    /// `origin` is leaving
    Leave { origin: Origin, timestamp: u64 },
}

impl ControlMessage {
    pub fn kind(&self) -> PacketKind {
        match self {
            ControlMessage::Join { .. } => PacketKind::Join,
            ControlMessage::JoinReply { .. } => PacketKind::JoinReply,
            ControlMessage::Leave { .. } => PacketKind::Leave,
        }
    }

    pub fn leave(origin: Origin) -> Self {
        ControlMessage::Leave {
            origin,
            timestamp: timestamp_now(),
        }
    }

    /// Write this message into a (pooled) packet
    pub fn encode_into(&self, packet: &mut Packet) {
        match self {
            ControlMessage::Join { origin } => {
                packet.prepare(0);
                packet
                    .set_kind(PacketKind::Join)
                    .set_origin(*origin)
                    .set_timestamp(timestamp_now());
            }
            ControlMessage::JoinReply { host, members } => {
                let mut payload = packet.prepare(members.len() * 8);
                for member in members {
                    payload.put_u64_le(member.0);
                }
                packet
                    .set_kind(PacketKind::JoinReply)
                    .set_origin(*host)
                    .set_timestamp(timestamp_now());
            }
            ControlMessage::Leave { origin, timestamp } => {
                packet.prepare(0);
                packet
                    .set_kind(PacketKind::Leave)
                    .set_origin(*origin)
                    .set_timestamp(*timestamp);
            }
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet::default();
        self.encode_into(&mut packet);
        packet
    }

    /// Decode from a validated view; media kinds are rejected
    pub fn decode(view: &PacketView<'_>) -> Result<Self, PacketError> {
        match view.kind {
            PacketKind::Join => Ok(ControlMessage::Join {
                origin: view.origin,
            }),
            PacketKind::JoinReply => {
                if view.payload.len() % 8 != 0 {
                    return Err(PacketError::MemberList(view.payload.len()));
                }
                let mut payload = view.payload;
                let mut members = Vec::with_capacity(payload.len() / 8);
                while payload.has_remaining() {
                    members.push(Origin(payload.get_u64_le()));
                }
                Ok(ControlMessage::JoinReply {
                    host: view.origin,
                    members,
                })
            }
            PacketKind::Leave => Ok(ControlMessage::Leave {
                origin: view.origin,
                timestamp: view.timestamp,
            }),
            PacketKind::Audio | PacketKind::Video => Err(PacketError::UnexpectedKind {
                expected: "control",
            }),
        }
    }

    /// Decode straight from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        Self::decode(&PacketView::parse(bytes)?)
    }
}
