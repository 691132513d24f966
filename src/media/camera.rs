//! Camera producer: capture, compress, publish

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, RgbImage};

use super::producer::{Produce, Produced};
use super::FrameSource;
use crate::buffer::RingWriter;
use crate::config::{MediaConfig, VideoFormat};
use crate::error::{MediaError, Result};
use crate::packet::{timestamp_now, Origin, Packet, PacketKind};

/// Compress one RGB frame into `out` (cleared first)
pub fn encode_frame(
    frame: &RgbImage,
    format: VideoFormat,
    jpeg_quality: u8,
    out: &mut Vec<u8>,
) -> std::result::Result<(), MediaError> {
    out.clear();
    let (width, height) = frame.dimensions();
    let pixels = frame.as_raw();
    let result = match format {
        VideoFormat::Png => {
            PngEncoder::new(&mut *out).write_image(pixels, width, height, ColorType::Rgb8)
        }
        VideoFormat::Jpeg => JpegEncoder::new_with_quality(&mut *out, jpeg_quality)
            .write_image(pixels, width, height, ColorType::Rgb8),
    };
    result.map_err(|e| MediaError::Encode(e.to_string()))
}

/// Periodic video producer
pub struct Camera<S: FrameSource> {
    source: S,
    origin: Origin,
    format: VideoFormat,
    jpeg_quality: u8,
    /// Reused compression buffer
    encoded: Vec<u8>,
}

impl<S: FrameSource> Camera<S> {
    pub fn new(source: S, origin: Origin, config: &MediaConfig) -> Self {
        Self {
            source,
            origin,
            format: config.video_format,
            jpeg_quality: config.jpeg_quality,
            encoded: Vec::new(),
        }
    }
}

impl<S: FrameSource> Produce for Camera<S> {
    fn produce(&mut self, writer: &mut RingWriter<Packet>) -> Result<Produced> {
        let frame = self.source.capture()?;
        let timestamp = timestamp_now();
        encode_frame(&frame, self.format, self.jpeg_quality, &mut self.encoded)?;

        let mut slot = writer.claim()?;
        slot.prepare(self.encoded.len()).copy_from_slice(&self.encoded);
        slot.set_kind(PacketKind::Video)
            .set_origin(self.origin)
            .set_timestamp(timestamp);
        let bytes = slot.capacity();
        slot.commit();

        Ok(Produced::Committed { bytes })
    }
}
