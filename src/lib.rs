//! # LAN Media Mesh
//!
//! Live audio and video between a handful of peers on a LAN, every peer
//! sending to every other peer directly.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 PEER                                      │
//! │                                                                           │
//! │  ┌──────────┐  ┌────────────┐  ┌──────────┐     producers (media)         │
//! │  │  Camera  │  │ Microphone │  │ Receiver │◄──────────── UDP ◄───────┐    │
//! │  └────┬─────┘  └─────┬──────┘  └────┬─────┘                          │    │
//! │       ▼              ▼              ▼                                │    │
//! │  ┌──────────┐  ┌────────────┐  ┌──────────┐     one ring per producer│    │
//! │  │ Ring<Pkt>│  │  Ring<Pkt> │  │ Ring<Pkt>│     (buffer)             │    │
//! │  └──┬────┬──┘  └─────┬──────┘  └──┬────┬──┘                          │    │
//! │     │    └─────────┐ │    ┌───────┘    │                             │    │
//! │     ▼              ▼ ▼    ▼            ▼        consumers (media)    │    │
//! │  ┌──────────┐  ┌──────────┐       ┌──────────┐                       │    │
//! │  │  Window  │  │  Sender  │       │ Speaker  │──► Line per origin    │    │
//! │  └────┬─────┘  └────┬─────┘       └──────────┘                       │    │
//! │       ▼             └─────────────────────────────── UDP ──► peers ──┘    │
//! │   VideoWall                          ▲                                    │
//! │                                      │ destinations                       │
//! │  ┌──────────────────┐   ┌────────────┴─────┐                              │
//! │  │ SignalingServer  │──►│  CallController  │  host / join / leave (TCP)   │
//! │  └──────────────────┘   └──────────────────┘                              │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Media only ever flows through the rings; the control path only ever
//! changes who the sender sends to and which per-peer sinks exist.

#[cfg(feature = "devices")]
pub mod audio;
pub mod buffer;
pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod network;
pub mod packet;
pub mod participant;
pub mod signaling;
pub mod worker;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default port for both the media (UDP) and signaling (TCP) endpoints
    pub const DEFAULT_PORT: u16 = 20000;

    /// Slots per producer ring
    pub const RING_CAPACITY: usize = 64;

    /// Slots per remote peer's audio line
    pub const LINE_CAPACITY: usize = 4;

    /// Initial slot size in bytes; slots grow to fit larger frames
    pub const PACKET_CAPACITY: usize = 2048;
}
