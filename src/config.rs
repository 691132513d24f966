//! Application configuration
//!
//! Loaded from TOML; every field has a default so partial files are valid.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::StallPolicy;
use crate::error::{Error, Result};
use crate::packet::TRAILER_SIZE;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub peer: PeerConfig,
    pub ring: RingConfig,
    pub media: MediaConfig,
    pub network: NetworkConfig,
    pub signaling: SignalingConfig,
}

/// Identity of this peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Media (UDP) and signaling (TCP) address; both use the same port number
    pub address: SocketAddr,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], crate::constants::DEFAULT_PORT)),
        }
    }
}

/// Ring buffer sizing and stall handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Slots per producer ring (power of two)
    pub capacity: usize,
    /// Slots per per-peer speaker line (power of two)
    pub line_capacity: usize,
    /// Initial byte size of each pooled packet; grows on demand
    pub packet_capacity: usize,
    /// Evict a consumer that blocks the producer this long; 0 waits forever
    pub stall_timeout_ms: u64,
    /// Longest a consumer parks when none of its rings has data
    pub consumer_park_ms: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: crate::constants::RING_CAPACITY,
            line_capacity: crate::constants::LINE_CAPACITY,
            packet_capacity: crate::constants::PACKET_CAPACITY,
            stall_timeout_ms: 500,
            consumer_park_ms: 5,
        }
    }
}

impl RingConfig {
    pub fn stall_policy(&self) -> StallPolicy {
        let timeout = (self.stall_timeout_ms > 0).then(|| Duration::from_millis(self.stall_timeout_ms));
        StallPolicy::from_timeout(timeout)
    }

    pub fn consumer_park(&self) -> Duration {
        Duration::from_millis(self.consumer_park_ms)
    }
}

/// Compressed frame format produced by the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Png,
    Jpeg,
}

/// Capture parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub frames_per_second: u32,
    pub width: u32,
    pub height: u32,
    pub video_format: VideoFormat,
    pub jpeg_quality: u8,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    /// Capture device name for the `devices` feature; the host default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            frames_per_second: 30,
            width: 320,
            height: 240,
            video_format: VideoFormat::Jpeg,
            jpeg_quality: 75,
            sample_rate: 8000,
            bits_per_sample: 16,
            channels: 1,
            input_device: None,
            output_device: None,
        }
    }
}

impl MediaConfig {
    /// PCM bytes captured per frame period
    pub fn audio_bytes_per_frame(&self) -> usize {
        let bytes_per_second =
            self.sample_rate as usize * self.channels as usize * (self.bits_per_sample as usize / 8);
        bytes_per_second / self.frames_per_second.max(1) as usize
    }
}

/// Media transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Receive poll timeout
    pub receive_poll_ms: u64,
    /// Pause after reopening the receive endpoint
    pub reconnect_backoff_ms: u64,
    /// Silence after which no peer is considered reachable
    pub liveness_timeout_ms: u64,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            receive_poll_ms: 100,
            reconnect_backoff_ms: 1000,
            liveness_timeout_ms: 5000,
            recv_buffer_size: 1 << 20,
            send_buffer_size: 1 << 20,
        }
    }
}

impl NetworkConfig {
    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

/// Control channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub request_timeout_ms: u64,
    pub max_frame_len: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 2000,
            max_frame_len: 64 * 1024,
        }
    }
}

impl SignalingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl AppConfig {
    /// Platform config file location, e.g. `~/.config/lan-media-mesh/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-media-mesh")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` (or the default location); a missing file yields defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, capacity) in [
            ("ring.capacity", self.ring.capacity),
            ("ring.line_capacity", self.ring.line_capacity),
        ] {
            if capacity < 2 || !capacity.is_power_of_two() {
                return Err(Error::Config(format!(
                    "{} must be a power of two >= 2, got {}",
                    name, capacity
                )));
            }
        }
        if self.ring.packet_capacity < TRAILER_SIZE {
            return Err(Error::Config(format!(
                "ring.packet_capacity must be at least {} bytes",
                TRAILER_SIZE
            )));
        }
        if self.media.frames_per_second == 0 {
            return Err(Error::Config("media.frames_per_second must be > 0".into()));
        }
        if self.media.bits_per_sample % 8 != 0 || self.media.channels == 0 {
            return Err(Error::Config("media audio format must be whole bytes per sample".into()));
        }
        if !(1..=100).contains(&self.media.jpeg_quality) {
            return Err(Error::Config("media.jpeg_quality must be within 1..=100".into()));
        }
        Ok(())
    }
}
