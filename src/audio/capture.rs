//! Microphone capture through cpal
//!
//! The cpal stream lives on its own thread; its callback converts samples to
//! 16-bit little-endian PCM and queues the bytes for the microphone producer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver};

use super::device::{input_device, stream_config};
use crate::config::MediaConfig;
use crate::error::MediaError;
use crate::media::AudioSource;

/// Capture device adapter implementing [`AudioSource`]
pub struct CpalMicrophone {
    running: Arc<AtomicBool>,
    queue: Arc<ArrayQueue<u8>>,
    overflows: Arc<AtomicU64>,
    error_rx: Receiver<MediaError>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalMicrophone {
    /// Open the configured input device and start capturing immediately
    pub fn open(config: &MediaConfig) -> Result<Self, MediaError> {
        let device = input_device(config.input_device.as_deref())?;
        let stream_config = stream_config(config.sample_rate, config.channels);
        // One second of PCM
        let capacity = config.sample_rate as usize * config.channels as usize * 2;
        let queue = Arc::new(ArrayQueue::new(capacity.max(1)));
        let overflows = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let (error_tx, error_rx) = bounded::<MediaError>(16);

        let queue_for_stream = queue.clone();
        let overflows_for_stream = overflows.clone();
        let running_for_loop = running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), MediaError>>(1);

        let handle = thread::Builder::new()
            .name("capture-microphone".to_string())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for sample in data {
                            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            for byte in value.to_le_bytes() {
                                if queue_for_stream.push(byte).is_err() {
                                    overflows_for_stream.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(MediaError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream.map_err(|e| MediaError::StreamError(e.to_string())) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
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
                // Dropping the stream stops capture
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
                return Err(MediaError::StreamError("Capture thread exited".to_string()));
            }
        }

        tracing::info!(
            sample_rate = config.sample_rate,
            channels = config.channels,
            "Microphone capture started"
        );

        Ok(Self {
            running,
            queue,
            overflows,
            error_rx,
            thread_handle: Some(handle),
        })
    }

    /// Bytes discarded because the producer fell behind
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl AudioSource for CpalMicrophone {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, MediaError> {
        if let Ok(e) = self.error_rx.try_recv() {
            return Err(e);
        }

        // Whole 16-bit samples only
        let wanted = buf.len().min(self.queue.len()) & !1;
        let mut read = 0;
        while read < wanted {
            match self.queue.pop() {
                Some(byte) => {
                    buf[read] = byte;
                    read += 1;
                }
                None => break,
            }
        }
        Ok(read)
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}
