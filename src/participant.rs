//! One peer: producers, consumers, transport and signaling wired together

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::call::{CallController, CallState};
use crate::config::{AppConfig, MediaConfig};
use crate::error::{CallError, NetworkError, Result, SignalingError};
use crate::media::synthetic::{LogDisplay, NullSpeakers, TestPattern, ToneSource};
use crate::media::{
    AudioSinkFactory, AudioSource, Camera, Consumer, FrameDisplay, FrameSource, Microphone, Producer,
    Receiver, ReceiverStats, Sender, SenderStats, Speaker, SpeakerLines, VideoWall, Window,
};
use crate::network::{
    DatagramSink, DatagramSource, Destinations, MemoryNetwork, UdpConfig, UdpSink, UdpSource,
};
use crate::packet::{ControlMessage, Origin};
use crate::signaling::{SignalingClient, SignalingServer};
use crate::worker::Schedule;

/// Local capture and output devices. Missing capture devices simply mean
/// this peer sends no audio or video.
pub struct Devices {
    pub camera: Option<Box<dyn FrameSource>>,
    pub microphone: Option<Box<dyn AudioSource>>,
    pub speakers: Arc<dyn AudioSinkFactory>,
    pub display: Arc<dyn FrameDisplay>,
}

impl Devices {
    /// Test pattern, 440 Hz tone, silent speakers and a logging display
    pub fn synthetic(media: &MediaConfig) -> Self {
        Self {
            camera: Some(Box::new(TestPattern::new(media.width, media.height))),
            microphone: Some(Box::new(ToneSource::new(media.sample_rate, 440.0))),
            speakers: Arc::new(NullSpeakers::default()),
            display: Arc::new(LogDisplay::new(u64::from(media.frames_per_second) * 10)),
        }
    }

    /// Receive-only peer
    pub fn headless(speakers: Arc<dyn AudioSinkFactory>, display: Arc<dyn FrameDisplay>) -> Self {
        Self {
            camera: None,
            microphone: None,
            speakers,
            display,
        }
    }
}

/// Media datagram transport
#[derive(Clone)]
pub enum Transport {
    Udp,
    /// In-process hub; several participants can share one
    Memory(MemoryNetwork),
}

/// A running peer.
///
/// ```text
///   camera ──────┬──► sender ──► network
///   microphone ──┘
///   camera ──────┬──► window
///   receiver ────┤
///                └──► speaker ──► line per origin
/// ```
pub struct Participant {
    address: SocketAddr,
    controller: Arc<CallController>,
    client: SignalingClient,
    server: SignalingServer,
    speaker_lines: SpeakerLines,
    wall: Arc<VideoWall>,
    sender_stats: Arc<SenderStats>,
    receiver_stats: Arc<ReceiverStats>,
    consumers: Vec<Consumer>,
    producers: Vec<Producer>,
}

impl Participant {
    /// Bind the signaling and media endpoints at `config.peer.address` and
    /// start every producer and consumer. Port 0 picks a free port, used for
    /// both endpoints.
    pub async fn start(config: &AppConfig, devices: Devices, transport: Transport) -> Result<Self> {
        config.validate()?;

        let requested = config.peer.address;
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| NetworkError::BindFailed {
                addr: requested,
                source,
            })?;
        let address = listener.local_addr()?;
        let origin = Origin::from_socket_addr(address).ok_or(CallError::UnsupportedAddress(address))?;

        let destinations = Destinations::new();
        let controller = Arc::new(CallController::new(address, destinations.clone())?);
        let server = SignalingServer::serve(listener, controller.clone(), &config.signaling)?;

        let media = match transport {
            Transport::Udp => {
                let udp = UdpConfig::from(&config.network);
                let source = UdpSource::bind(address, udp.clone())?;
                let sink = UdpSink::bind(address, udp)?;
                MediaPath::start(config, origin, devices, source, sink, destinations)?
            }
            Transport::Memory(network) => {
                let source = network.bind(address)?;
                let sink = network.sink(address);
                MediaPath::start(config, origin, devices, source, sink, destinations)?
            }
        };
        controller.add_listener(Arc::new(media.speaker_lines.clone()));
        controller.add_listener(Arc::new(media.window_tiles));

        tracing::info!(%address, "Participant started");

        Ok(Self {
            address,
            controller,
            client: SignalingClient::new(&config.signaling),
            server,
            speaker_lines: media.speaker_lines,
            wall: media.wall,
            sender_stats: media.sender_stats,
            receiver_stats: media.receiver_stats,
            consumers: media.consumers,
            producers: media.producers,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn origin(&self) -> Origin {
        self.controller.local()
    }

    pub fn state(&self) -> CallState {
        self.controller.state()
    }

    pub fn members(&self) -> Vec<Origin> {
        self.controller.members()
    }

    /// Current media destinations
    pub fn destinations(&self) -> Vec<SocketAddr> {
        let mut destinations = self.controller.destinations().snapshot();
        destinations.sort();
        destinations
    }

    pub fn controller(&self) -> &Arc<CallController> {
        &self.controller
    }

    pub fn speaker_lines(&self) -> &SpeakerLines {
        &self.speaker_lines
    }

    pub fn wall(&self) -> &Arc<VideoWall> {
        &self.wall
    }

    pub fn sender_stats(&self) -> &Arc<SenderStats> {
        &self.sender_stats
    }

    pub fn receiver_stats(&self) -> &Arc<ReceiverStats> {
        &self.receiver_stats
    }

    /// Start a call anchored here, leaving any current call first
    pub async fn host(&self) -> Result<()> {
        if self.state() != CallState::Idle {
            self.leave().await?;
        }
        let controller = self.controller.clone();
        tokio::task::spawn_blocking(move || controller.host())
            .await
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Join the call hosted at `host`. On failure this peer stays idle.
    pub async fn join(&self, host: SocketAddr) -> Result<()> {
        self.controller.ensure_idle()?;

        let join = ControlMessage::Join {
            origin: self.origin(),
        };
        let reply = self.client.request(host, &join).await?;
        let unannounced = self.controller.apply_join_reply(host, reply)?;

        for member in unannounced {
            let Some(addr) = member.to_socket_addr() else {
                continue;
            };
            match self.client.request(addr, &join).await {
                Ok(ControlMessage::JoinReply { .. }) => {
                    tracing::debug!(%member, "Announced to member");
                }
                Ok(other) => {
                    let e = SignalingError::UnexpectedReply(format!("{:?}", other.kind()));
                    tracing::warn!(%member, error = %e, "Announce failed");
                }
                Err(e) => tracing::warn!(%member, error = %e, "Announce failed"),
            }
        }
        Ok(())
    }

    /// Tell every member we are leaving, then drop the local call
    pub async fn leave(&self) -> Result<()> {
        if self.state() == CallState::Idle {
            return Err(CallError::NotInCall.into());
        }

        let leave = ControlMessage::leave(self.origin());
        for member in self.controller.leave_targets() {
            match self.client.request(member, &leave).await {
                Ok(ControlMessage::Leave { .. }) => {}
                Ok(other) => tracing::warn!(%member, kind = ?other.kind(), "Unexpected LEAVE acknowledgement"),
                Err(e) => tracing::warn!(%member, error = %e, "Failed to deliver LEAVE"),
            }
        }
        // Clearing drops per-peer lines, which joins their playback threads
        let controller = self.controller.clone();
        tokio::task::spawn_blocking(move || controller.clear())
            .await
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Leave any call, stop serving requests and join every media thread
    pub async fn shutdown(mut self) {
        if self.state() != CallState::Idle {
            if let Err(e) = self.leave().await {
                tracing::warn!(error = %e, "Leave during shutdown failed");
            }
        }
        self.server.shutdown();

        // Joining workers can wait out a receiver backoff; keep it off the runtime
        let media = self.take_media();
        if let Err(e) = tokio::task::spawn_blocking(move || media.stop()).await {
            tracing::error!(error = %e, "Media teardown panicked");
        }
        tracing::info!(address = %self.address, "Participant stopped");
    }

    fn take_media(&mut self) -> MediaThreads {
        MediaThreads {
            producers: std::mem::take(&mut self.producers),
            consumers: std::mem::take(&mut self.consumers),
            lines: self.speaker_lines.clone(),
        }
    }
}

/// Dropping a participant without `shutdown` stops its media in place
impl Drop for Participant {
    fn drop(&mut self) {
        self.take_media().stop();
    }
}

/// Threads owned by the media path, detached for teardown
struct MediaThreads {
    producers: Vec<Producer>,
    consumers: Vec<Consumer>,
    lines: SpeakerLines,
}

impl MediaThreads {
    fn stop(mut self) {
        for producer in &mut self.producers {
            producer.stop();
        }
        for consumer in &mut self.consumers {
            consumer.stop();
        }
        self.lines.clear();
    }
}

/// Everything on the media side of one participant
struct MediaPath {
    producers: Vec<Producer>,
    consumers: Vec<Consumer>,
    speaker_lines: SpeakerLines,
    window_tiles: crate::media::WindowTiles,
    wall: Arc<VideoWall>,
    sender_stats: Arc<SenderStats>,
    receiver_stats: Arc<ReceiverStats>,
}

impl MediaPath {
    fn start<S, K>(
        config: &AppConfig,
        origin: Origin,
        devices: Devices,
        source: S,
        sink: K,
        destinations: Destinations,
    ) -> Result<Self>
    where
        S: DatagramSource,
        K: DatagramSink + 'static,
    {
        let ring = &config.ring;
        let period = Schedule::per_second(config.media.frames_per_second);

        let receiver = Receiver::new(source, &config.network);
        let receiver_stats = receiver.stats();
        let receiver = Producer::spawn("receiver", Schedule::Continuous, ring, receiver)?;

        let camera = devices
            .camera
            .map(|source| Producer::spawn("camera", period, ring, Camera::new(source, origin, &config.media)))
            .transpose()?;
        let chunk = config.media.audio_bytes_per_frame();
        let microphone = devices
            .microphone
            .map(|source| Producer::spawn("microphone", period, ring, Microphone::new(source, origin, chunk)))
            .transpose()?;

        let sender = Sender::new(sink, destinations);
        let sender_stats = sender.stats();
        let sender = Consumer::spawn("sender", ring.consumer_park(), sender)?;

        let speaker = Speaker::new(devices.speakers, ring);
        let speaker_lines = speaker.lines();
        let speaker = Consumer::spawn("speaker", ring.consumer_park(), speaker)?;

        let wall = Arc::new(VideoWall::new());
        let window = Window::new(wall.clone(), devices.display);
        let window_tiles = window.tiles();
        let window = Consumer::spawn("window", ring.consumer_park(), window)?;

        for local in camera.iter().chain(microphone.iter()) {
            sender.subscribe_to(local);
        }
        speaker.subscribe_to(&receiver);
        if let Some(camera) = &camera {
            window.subscribe_to(camera);
        }
        window.subscribe_to(&receiver);

        let mut producers = vec![receiver];
        producers.extend(camera);
        producers.extend(microphone);

        Ok(Self {
            producers,
            consumers: vec![sender, speaker, window],
            speaker_lines,
            window_tiles,
            wall,
            sender_stats,
            receiver_stats,
        })
    }
}
