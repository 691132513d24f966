//! Speaker output through cpal, one output stream per remote peer

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::bounded;

use super::device::{output_device, stream_config};
use crate::config::MediaConfig;
use crate::error::MediaError;
use crate::media::{AudioSink, AudioSinkFactory};
use crate::packet::Origin;

/// Opens a cpal output stream for every remote peer
pub struct CpalSpeakers {
    device_name: Option<String>,
    sample_rate: u32,
    channels: u16,
}

impl CpalSpeakers {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            device_name: config.output_device.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }
}

impl AudioSinkFactory for CpalSpeakers {
    fn open(&self, origin: Origin) -> Result<Box<dyn AudioSink>, MediaError> {
        let line = CpalLine::open(origin, self.device_name.as_deref(), self.sample_rate, self.channels)?;
        Ok(Box::new(line))
    }
}

/// One playback stream; samples written faster than the device drains
/// them are dropped
pub struct CpalLine {
    origin: Origin,
    running: Arc<AtomicBool>,
    queue: Arc<ArrayQueue<i16>>,
    dropped: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalLine {
    fn open(
        origin: Origin,
        device_name: Option<&str>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, MediaError> {
        let device = output_device(device_name)?;
        let config = stream_config(sample_rate, channels);
        // Half a second of samples
        let capacity = (sample_rate as usize * channels as usize / 2).max(1);
        let queue = Arc::new(ArrayQueue::<i16>::new(capacity));
        let running = Arc::new(AtomicBool::new(true));

        let queue_for_stream = queue.clone();
        let running_for_loop = running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), MediaError>>(1);

        let handle = thread::Builder::new()
            .name(format!("playback-{}", origin))
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for sample in data.iter_mut() {
                            // Silence on underrun
                            *sample = queue_for_stream
                                .pop()
                                .map(|value| value as f32 / i16::MAX as f32)
                                .unwrap_or(0.0);
                        }
                    },
                    move |err| {
                        tracing::error!(%origin, error = %err, "Playback stream error");
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(MediaError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(MediaError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| MediaError::Spawn(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(MediaError::StreamError("Playback thread exited".to_string()));
            }
        }

        tracing::debug!(%origin, "Playback stream opened");

        Ok(Self {
            origin,
            running,
            queue,
            dropped: Arc::new(AtomicU64::new(0)),
            thread_handle: Some(handle),
        })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AudioSink for CpalLine {
    fn write(&mut self, pcm: &[u8]) -> Result<(), MediaError> {
        for bytes in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([bytes[0], bytes[1]]);
            if self.queue.push(sample).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Drop for CpalLine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        tracing::debug!(origin = %self.origin, dropped = self.dropped(), "Playback stream closed");
    }
}
