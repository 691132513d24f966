//! Video consumer and the per-peer tile wall it renders into

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use super::consumer::Consume;
use super::FrameDisplay;
use crate::call::PeerListener;
use crate::packet::{KindMask, Origin, Packet};

struct Tile {
    image: RgbImage,
    frames: u64,
}

/// Latest decoded frame per origin
#[derive(Default)]
pub struct VideoWall {
    tiles: DashMap<Origin, Tile>,
    /// Origins whose tiles were removed and may not be recreated
    departed: DashSet<Origin>,
}

impl VideoWall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `origin`'s tile, creating it on the first frame
    pub fn update(&self, origin: Origin, image: RgbImage) {
        self.tiles
            .entry(origin)
            .and_modify(|tile| {
                tile.frames += 1;
            })
            .or_insert_with(|| Tile {
                image: RgbImage::new(0, 0),
                frames: 1,
            })
            .image = image;
    }

    /// Drop `origin`'s tile and bar it until readmitted
    pub fn remove(&self, origin: Origin) -> bool {
        self.departed.insert(origin);
        self.tiles.remove(&origin).is_some()
    }

    pub fn readmit(&self, origin: Origin) {
        self.departed.remove(&origin);
    }

    pub fn is_departed(&self, origin: Origin) -> bool {
        self.departed.contains(&origin)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Origins in layout order
    pub fn origins(&self) -> Vec<Origin> {
        let mut origins: Vec<Origin> = self.tiles.iter().map(|tile| *tile.key()).collect();
        origins.sort();
        origins
    }

    pub fn frame(&self, origin: Origin) -> Option<RgbImage> {
        self.tiles.get(&origin).map(|tile| tile.image.clone())
    }

    /// Frames received from `origin` since its tile was created
    pub fn frame_count(&self, origin: Origin) -> u64 {
        self.tiles.get(&origin).map(|tile| tile.frames).unwrap_or(0)
    }

    /// `(columns, rows)` of a near-square grid holding every tile
    pub fn grid(&self) -> (u32, u32) {
        grid_for(self.len())
    }

    /// Render every tile, scaled to `tile_width` x `tile_height`, into one image
    pub fn compose(&self, tile_width: u32, tile_height: u32) -> RgbImage {
        let (columns, rows) = self.grid();
        let mut canvas = RgbImage::from_pixel(columns * tile_width, rows * tile_height, Rgb([0, 0, 0]));

        for (index, origin) in self.origins().into_iter().enumerate() {
            let Some(frame) = self.frame(origin) else {
                continue;
            };
            let index = index as u32;
            let scaled = imageops::resize(&frame, tile_width, tile_height, FilterType::Triangle);
            let x = (index % columns) * tile_width;
            let y = (index / columns) * tile_height;
            imageops::overlay(&mut canvas, &scaled, x as i64, y as i64);
        }
        canvas
    }
}

fn grid_for(tiles: usize) -> (u32, u32) {
    if tiles == 0 {
        return (0, 0);
    }
    let columns = (tiles as f64).sqrt().ceil() as u32;
    let rows = (tiles as u32).div_ceil(columns);
    (columns, rows)
}

/// Window counters
#[derive(Debug, Default)]
pub struct WindowStats {
    pub frames: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl WindowStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

/// Removes a departed peer's tile and tells the display
#[derive(Clone)]
pub struct WindowTiles {
    wall: Arc<VideoWall>,
    display: Arc<dyn FrameDisplay>,
}

impl PeerListener for WindowTiles {
    fn peer_left(&self, origin: Origin) {
        if self.wall.remove(origin) {
            self.display.remove(origin);
        }
    }

    fn peer_joined(&self, origin: Origin) {
        self.wall.readmit(origin);
    }
}

/// Video consumer: decodes frames into the wall and asks for a repaint.
/// Undecodable frames are counted and dropped.
pub struct Window {
    wall: Arc<VideoWall>,
    display: Arc<dyn FrameDisplay>,
    stats: Arc<WindowStats>,
}

impl Window {
    pub fn new(wall: Arc<VideoWall>, display: Arc<dyn FrameDisplay>) -> Self {
        Self {
            wall,
            display,
            stats: Arc::new(WindowStats::default()),
        }
    }

    pub fn wall(&self) -> &Arc<VideoWall> {
        &self.wall
    }

    pub fn tiles(&self) -> WindowTiles {
        WindowTiles {
            wall: self.wall.clone(),
            display: self.display.clone(),
        }
    }

    pub fn stats(&self) -> Arc<WindowStats> {
        self.stats.clone()
    }
}

impl Consume for Window {
    fn interest(&self) -> KindMask {
        KindMask::VIDEO
    }

    fn consume(&mut self, packet: &Packet) {
        let origin = packet.origin();
        if self.wall.is_departed(origin) {
            return;
        }
        match image::load_from_memory(packet.payload()) {
            Ok(decoded) => {
                self.wall.update(origin, decoded.to_rgb8());
                if self.wall.is_departed(origin) {
                    self.wall.tiles.remove(&origin);
                    return;
                }
                self.stats.frames.fetch_add(1, Ordering::Relaxed);
                self.display.repaint(&self.wall, origin);
            }
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%origin, error = %e, "Dropping undecodable frame");
            }
        }
    }
}
