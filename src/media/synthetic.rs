//! Synthetic devices for running without camera, microphone or speakers

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use image::{Rgb, RgbImage};

use super::{AudioSink, AudioSinkFactory, AudioSource, FrameDisplay, FrameSource, VideoWall};
use crate::error::MediaError;
use crate::packet::Origin;

/// Moving colour-bar test pattern
pub struct TestPattern {
    width: u32,
    height: u32,
    frame: u32,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame: 0,
        }
    }
}

impl FrameSource for TestPattern {
    fn capture(&mut self) -> Result<RgbImage, MediaError> {
        let shift = self.frame;
        self.frame = self.frame.wrapping_add(1);
        let width = self.width.max(1);

        Ok(RgbImage::from_fn(self.width, self.height, |x, y| {
            let bar = (x.wrapping_add(shift) % width) * 8 / width;
            let level = 255 - (y * 64 / self.height.max(1)) as u8;
            Rgb([
                if bar & 1 != 0 { level } else { 0 },
                if bar & 2 != 0 { level } else { 0 },
                if bar & 4 != 0 { level } else { 0 },
            ])
        }))
    }
}

/// Sine tone as 16-bit little-endian mono PCM, produced at the real-time rate
pub struct ToneSource {
    sample_rate: u32,
    frequency: f32,
    phase: f32,
    started: Instant,
    samples_emitted: u64,
}

impl ToneSource {
    pub fn new(sample_rate: u32, frequency: f32) -> Self {
        Self {
            sample_rate,
            frequency,
            phase: 0.0,
            started: Instant::now(),
            samples_emitted: 0,
        }
    }
}

impl AudioSource for ToneSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, MediaError> {
        let due = (self.started.elapsed().as_secs_f64() * self.sample_rate as f64) as u64;
        let available = due.saturating_sub(self.samples_emitted) as usize;
        let samples = available.min(buf.len() / 2);

        let step = TAU * self.frequency / self.sample_rate as f32;
        for chunk in buf[..samples * 2].chunks_exact_mut(2) {
            let value = (self.phase.sin() * i16::MAX as f32 * 0.25) as i16;
            chunk.copy_from_slice(&value.to_le_bytes());
            self.phase = (self.phase + step) % TAU;
        }

        self.samples_emitted += samples as u64;
        Ok(samples * 2)
    }
}

/// Speaker stand-in that discards PCM and counts it
#[derive(Debug, Default, Clone)]
pub struct NullSpeakers {
    bytes: Arc<AtomicU64>,
}

impl NullSpeakers {
    pub fn bytes_played(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

struct NullLine {
    bytes: Arc<AtomicU64>,
}

impl AudioSink for NullLine {
    fn write(&mut self, pcm: &[u8]) -> Result<(), MediaError> {
        self.bytes.fetch_add(pcm.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl AudioSinkFactory for NullSpeakers {
    fn open(&self, _origin: Origin) -> Result<Box<dyn AudioSink>, MediaError> {
        Ok(Box::new(NullLine {
            bytes: self.bytes.clone(),
        }))
    }
}

/// Display stand-in that logs the wall layout once per `every` repaints
pub struct LogDisplay {
    every: u64,
    repaints: AtomicU64,
}

impl LogDisplay {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            repaints: AtomicU64::new(0),
        }
    }
}

impl FrameDisplay for LogDisplay {
    fn repaint(&self, wall: &VideoWall, updated: Origin) {
        let count = self.repaints.fetch_add(1, Ordering::Relaxed);
        if count % self.every == 0 {
            let (columns, rows) = wall.grid();
            tracing::info!(
                %updated,
                tiles = wall.len(),
                columns,
                rows,
                frames = wall.frame_count(updated),
                "Video wall repainted"
            );
        }
    }

    fn remove(&self, origin: Origin) {
        tracing::info!(%origin, "Video tile removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pattern_moves() {
        let mut pattern = TestPattern::new(32, 8);
        let first = pattern.capture().unwrap();
        let second = pattern.capture().unwrap();
        assert_eq!(first.dimensions(), (32, 8));
        assert_ne!(first, second);
    }

    #[test]
    fn test_tone_is_paced_by_the_clock() {
        let mut tone = ToneSource::new(8000, 440.0);
        let mut buf = vec![0u8; 8000];

        thread::sleep(Duration::from_millis(50));
        let n = tone.read(&mut buf).unwrap();
        assert_eq!(n % 2, 0);
        // Roughly 50 ms of 8 kHz mono, 16-bit
        assert!((600..=4000).contains(&n), "read {} bytes", n);

        let again = tone.read(&mut buf).unwrap();
        assert!(again < n);
    }
}
