//! Microphone producer

use super::producer::{Produce, Produced};
use super::AudioSource;
use crate::buffer::RingWriter;
use crate::error::Result;
use crate::packet::{timestamp_now, Origin, Packet, PacketKind};

/// Periodic audio producer.
///
/// Reads straight into the claimed slot. The recorded payload length is the
/// byte count the device actually returned, never the chunk size.
pub struct Microphone<S: AudioSource> {
    source: S,
    origin: Origin,
    /// Largest read per period
    chunk: usize,
}

impl<S: AudioSource> Microphone<S> {
    pub fn new(source: S, origin: Origin, chunk: usize) -> Self {
        Self {
            source,
            origin,
            chunk: chunk.max(1),
        }
    }
}

impl<S: AudioSource> Produce for Microphone<S> {
    fn produce(&mut self, writer: &mut RingWriter<Packet>) -> Result<Produced> {
        let mut slot = writer.claim()?;
        let timestamp = timestamp_now();
        let read = self.source.read(slot.prepare(self.chunk))?;
        if read == 0 {
            // Dropping the claim publishes nothing
            return Ok(Produced::Nothing);
        }

        slot.prepare(read.min(self.chunk));
        slot.set_kind(PacketKind::Audio)
            .set_origin(self.origin)
            .set_timestamp(timestamp);
        let bytes = slot.capacity();
        slot.commit();

        Ok(Produced::Committed { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{RingBuffer, StallPolicy};
    use crate::error::MediaError;

    /// Returns a scripted byte count per read
    struct Scripted {
        reads: Vec<usize>,
    }

    impl AudioSource for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, MediaError> {
            let n = if self.reads.is_empty() { 0 } else { self.reads.remove(0) };
            buf[..n].fill(0xAB);
            Ok(n)
        }
    }

    #[test]
    fn test_payload_length_is_bytes_read() {
        let (ring, mut writer) = RingBuffer::new(4, StallPolicy::Block, Packet::default).unwrap();
        let sub = ring.subscribe();
        let mut microphone = Microphone::new(Scripted { reads: vec![3, 0, 64] }, Origin(11), 64);

        assert!(matches!(microphone.produce(&mut writer).unwrap(), Produced::Committed { .. }));
        assert_eq!(microphone.produce(&mut writer).unwrap(), Produced::Nothing);
        assert!(matches!(microphone.produce(&mut writer).unwrap(), Produced::Committed { .. }));
        assert_eq!(ring.producer_index(), 2);

        let slot = sub.acquire().unwrap();
        assert_eq!(slot.kind(), Some(PacketKind::Audio));
        assert_eq!(slot.payload(), &[0xAB; 3]);
        assert_eq!(slot.origin(), Origin(11));
        drop(slot);
        sub.release();

        let slot = sub.acquire().unwrap();
        assert_eq!(slot.payload_len(), 64);
    }
}
