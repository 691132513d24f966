//! Producers and consumers of media packets
//!
//! ```text
//!   Camera ─────┐                       ┌──► Sender ──► network
//!   Microphone ─┼─► RingBuffer<Packet> ─┼──► Speaker ─► Line (per origin) ─► AudioSink
//!   Receiver ───┘   (one per producer)  └──► Window ──► VideoWall ─► FrameDisplay
//! ```
//!
//! Devices sit behind the small traits in this module so that capture,
//! playback and rendering can be swapped for synthetic stand-ins.

pub mod camera;
pub mod consumer;
pub mod microphone;
pub mod producer;
pub mod receiver;
pub mod sender;
pub mod speaker;
pub mod synthetic;
pub mod window;

use image::RgbImage;

use crate::error::MediaError;
use crate::packet::Origin;

pub use camera::Camera;
pub use consumer::{Consume, Consumer, ConsumerStats};
pub use microphone::Microphone;
pub use producer::{PacketRing, Produce, Produced, Producer, ProducerStats};
pub use receiver::{Receiver, ReceiverStats};
pub use sender::{Sender, SenderStats};
pub use speaker::{Speaker, SpeakerLines, SpeakerStats};
pub use window::{VideoWall, Window, WindowStats, WindowTiles};

/// Camera boundary: one uncompressed frame per call
pub trait FrameSource: Send + 'static {
    fn capture(&mut self) -> Result<RgbImage, MediaError>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn capture(&mut self) -> Result<RgbImage, MediaError> {
        (**self).capture()
    }
}

/// Microphone boundary
pub trait AudioSource: Send + 'static {
    /// Copy whatever PCM is available into `buf` and return the byte count.
    /// Must not block for longer than one frame period.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, MediaError>;
}

impl AudioSource for Box<dyn AudioSource> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, MediaError> {
        (**self).read(buf)
    }
}

/// Audio output boundary for one peer's stream
pub trait AudioSink: Send + 'static {
    fn write(&mut self, pcm: &[u8]) -> Result<(), MediaError>;
}

/// Opens one audio output per remote peer
pub trait AudioSinkFactory: Send + Sync + 'static {
    fn open(&self, origin: Origin) -> Result<Box<dyn AudioSink>, MediaError>;
}

/// Rendering boundary, notified whenever a tile changes
pub trait FrameDisplay: Send + Sync + 'static {
    fn repaint(&self, wall: &VideoWall, updated: Origin);

    /// A peer's tile was removed
    fn remove(&self, _origin: Origin) {}
}
