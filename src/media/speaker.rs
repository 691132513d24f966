//! Audio playback: demultiplex by origin into per-peer lines

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use super::consumer::{Consume, Consumer};
use super::{AudioSink, AudioSinkFactory};
use crate::buffer::{RingBuffer, RingWriter, StallPolicy};
use crate::call::PeerListener;
use crate::config::RingConfig;
use crate::error::Result;
use crate::packet::{KindMask, Origin, Packet};

/// Speaker counters
#[derive(Debug, Default)]
pub struct SpeakerStats {
    pub packets: AtomicU64,
    /// Packets discarded because a line's ring was full
    pub dropped: AtomicU64,
    pub lines_opened: AtomicU64,
    pub open_failures: AtomicU64,
}

impl SpeakerStats {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn lines_opened(&self) -> u64 {
        self.lines_opened.load(Ordering::Relaxed)
    }
}

/// Plays one line's ring into its audio output
struct LinePlayback {
    origin: Origin,
    sink: Box<dyn AudioSink>,
    errors: u64,
}

impl Consume for LinePlayback {
    fn interest(&self) -> KindMask {
        KindMask::AUDIO
    }

    fn consume(&mut self, packet: &Packet) {
        if let Err(e) = self.sink.write(packet.payload()) {
            if self.errors % 100 == 0 {
                tracing::warn!(origin = %self.origin, error = %e, "Audio playback failed");
            }
            self.errors += 1;
        }
    }
}

/// One remote peer's audio: a small ring plus its own playback thread.
/// Dropping the line stops and joins the thread.
pub struct Line {
    origin: Origin,
    /// The writer's parker is not `Sync`; lines live in a shared map
    writer: Mutex<RingWriter<Packet>>,
    /// Held so the playback thread lives exactly as long as the line
    _playback: Consumer,
}

impl Line {
    fn open(origin: Origin, sink: Box<dyn AudioSink>, config: &RingConfig) -> Result<Self> {
        let (ring, writer) = RingBuffer::new(
            config.line_capacity,
            StallPolicy::Block,
            Packet::factory(config.packet_capacity),
        )?;
        let playback = Consumer::spawn(
            format!("line-{}", origin),
            config.consumer_park(),
            LinePlayback {
                origin,
                sink,
                errors: 0,
            },
        )?;
        playback.subscribe(&ring);

        Ok(Self {
            origin,
            writer: Mutex::new(writer),
            _playback: playback,
        })
    }

    /// Queue a copy of `packet` without waiting; false when the line is full
    fn push(&mut self, packet: &Packet) -> bool {
        let writer = self.writer.get_mut();
        let Some(mut slot) = writer.try_claim() else {
            return false;
        };
        match slot.copy_from_wire(packet.as_bytes()) {
            Ok(()) => {
                slot.commit();
                true
            }
            Err(e) => {
                tracing::debug!(origin = %self.origin, error = %e, "Malformed audio packet");
                false
            }
        }
    }
}

/// Shared registry of open lines, keyed by origin.
///
/// Origins that left the call stay barred from opening a new line until
/// they are readmitted, so packets still in flight cannot resurrect one.
#[derive(Clone, Default)]
pub struct SpeakerLines {
    lines: Arc<DashMap<Origin, Line>>,
    departed: Arc<DashSet<Origin>>,
}

impl SpeakerLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn contains(&self, origin: Origin) -> bool {
        self.lines.contains_key(&origin)
    }

    pub fn origins(&self) -> Vec<Origin> {
        self.lines.iter().map(|line| *line.key()).collect()
    }

    pub fn is_departed(&self, origin: Origin) -> bool {
        self.departed.contains(&origin)
    }

    /// Allow `origin` to open a line again
    pub fn readmit(&self, origin: Origin) {
        self.departed.remove(&origin);
    }

    /// Tear down `origin`'s line, joining its playback thread, and bar it
    /// until readmitted
    pub fn remove(&self, origin: Origin) -> bool {
        self.departed.insert(origin);
        let removed = self.lines.remove(&origin).is_some();
        if removed {
            tracing::info!(%origin, "Audio line closed");
        }
        removed
    }

    pub fn clear(&self) {
        self.lines.clear();
    }
}

impl PeerListener for SpeakerLines {
    fn peer_left(&self, origin: Origin) {
        self.remove(origin);
    }

    fn peer_joined(&self, origin: Origin) {
        self.readmit(origin);
    }
}

/// Audio consumer that routes each origin's packets to its own line.
///
/// Lines are created on the first packet from a new origin. Pushing into a
/// line never blocks, so one slow output cannot hold back the others.
pub struct Speaker {
    factory: Arc<dyn AudioSinkFactory>,
    config: RingConfig,
    lines: SpeakerLines,
    stats: Arc<SpeakerStats>,
}

impl Speaker {
    pub fn new(factory: Arc<dyn AudioSinkFactory>, config: &RingConfig) -> Self {
        Self {
            factory,
            config: config.clone(),
            lines: SpeakerLines::new(),
            stats: Arc::new(SpeakerStats::default()),
        }
    }

    /// Handle for tearing lines down from outside the playback path
    pub fn lines(&self) -> SpeakerLines {
        self.lines.clone()
    }

    pub fn stats(&self) -> Arc<SpeakerStats> {
        self.stats.clone()
    }

    fn open_line(&self, origin: Origin) -> Result<Line> {
        let sink = self.factory.open(origin)?;
        Line::open(origin, sink, &self.config)
    }
}

impl Consume for Speaker {
    fn interest(&self) -> KindMask {
        KindMask::AUDIO
    }

    fn consume(&mut self, packet: &Packet) {
        let origin = packet.origin();
        self.stats.packets.fetch_add(1, Ordering::Relaxed);

        if self.lines.is_departed(origin) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !self.lines.contains(origin) {
            match self.open_line(origin) {
                Ok(line) => {
                    self.lines.lines.insert(origin, line);
                    // Lost a race with peer_left
                    if self.lines.is_departed(origin) {
                        self.lines.lines.remove(&origin);
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    self.stats.lines_opened.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(%origin, "Audio line opened");
                }
                Err(e) => {
                    let failures = self.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                    if failures % 100 == 0 {
                        tracing::warn!(%origin, error = %e, "Failed to open audio line");
                    }
                    return;
                }
            }
        }

        let pushed = self
            .lines
            .lines
            .get_mut(&origin)
            .map(|mut line| line.push(packet))
            .unwrap_or(false);
        if !pushed {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::media::synthetic::NullSpeakers;
    use crate::packet::PacketKind;
    use std::time::{Duration, Instant};

    fn audio_from(origin: Origin, payload: &[u8]) -> Packet {
        let mut packet = Packet::default();
        packet.prepare(payload.len()).copy_from_slice(payload);
        packet.set_kind(PacketKind::Audio).set_origin(origin);
        packet
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    /// Output that never finishes a write until released
    struct Stuck {
        gate: Arc<Mutex<()>>,
    }

    impl AudioSink for Stuck {
        fn write(&mut self, _pcm: &[u8]) -> std::result::Result<(), MediaError> {
            drop(self.gate.lock());
            Ok(())
        }
    }

    struct StuckFactory {
        gate: Arc<Mutex<()>>,
        stuck: Origin,
        other: NullSpeakers,
    }

    impl AudioSinkFactory for StuckFactory {
        fn open(&self, origin: Origin) -> std::result::Result<Box<dyn AudioSink>, MediaError> {
            if origin == self.stuck {
                Ok(Box::new(Stuck {
                    gate: self.gate.clone(),
                }))
            } else {
                self.other.open(origin)
            }
        }
    }

    fn assert_shareable<T: Send + Sync>() {}
    fn assert_sendable<T: Send>() {}

    #[test]
    fn test_lines_can_cross_threads() {
        assert_shareable::<Line>();
        assert_shareable::<SpeakerLines>();
        assert_sendable::<Speaker>();

        let mut speaker = Speaker::new(Arc::new(NullSpeakers::default()), &RingConfig::default());
        let shared = speaker.lines();
        speaker.consume(&audio_from(Origin(4), &[0; 8]));

        let remote = std::thread::spawn(move || shared.remove(Origin(4)));
        assert!(remote.join().unwrap());
        assert!(speaker.lines().is_empty());
    }

    #[test]
    fn test_one_line_per_origin() {
        let speakers = NullSpeakers::default();
        let mut speaker = Speaker::new(Arc::new(speakers.clone()), &RingConfig::default());
        let lines = speaker.lines();

        speaker.consume(&audio_from(Origin(1), &[1; 100]));
        speaker.consume(&audio_from(Origin(2), &[2; 50]));
        speaker.consume(&audio_from(Origin(1), &[1; 100]));

        assert_eq!(lines.len(), 2);
        assert_eq!(speaker.stats().lines_opened(), 2);
        assert!(wait_for(Duration::from_secs(2), || speakers.bytes_played() == 250));

        assert!(lines.remove(Origin(1)));
        assert!(!lines.contains(Origin(1)));
        assert!(lines.contains(Origin(2)));
    }

    #[test]
    fn test_stalled_line_does_not_block_others() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let others = NullSpeakers::default();
        let factory = StuckFactory {
            gate: gate.clone(),
            stuck: Origin(1),
            other: others.clone(),
        };
        let config = RingConfig::default();
        let mut speaker = Speaker::new(Arc::new(factory), &config);

        // Far more than the stuck line can buffer
        for _ in 0..(config.line_capacity * 4) {
            speaker.consume(&audio_from(Origin(1), &[0; 16]));
        }
        speaker.consume(&audio_from(Origin(2), &[0; 16]));

        assert!(speaker.stats().dropped() > 0);
        assert!(wait_for(Duration::from_secs(2), || others.bytes_played() == 16));

        drop(held);
        speaker.lines().clear();
    }

    #[test]
    fn test_peer_left_closes_line() {
        let mut speaker = Speaker::new(Arc::new(NullSpeakers::default()), &RingConfig::default());
        let lines = speaker.lines();
        speaker.consume(&audio_from(Origin(9), &[0; 8]));
        assert_eq!(lines.len(), 1);

        lines.peer_left(Origin(9));
        assert!(lines.is_empty());

        // Stragglers from a departed peer do not reopen its line
        speaker.consume(&audio_from(Origin(9), &[0; 8]));
        assert!(lines.is_empty());
        assert_eq!(speaker.stats().dropped(), 1);

        lines.peer_joined(Origin(9));
        speaker.consume(&audio_from(Origin(9), &[0; 8]));
        assert_eq!(lines.len(), 1);
    }
}
