//! Test utilities for integration tests.
//!
//! This module provides a mock tile source and helpers for building tile
//! payloads and reading back the rasters the crate writes.

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tile_mosaic::error::FetchError;
use tile_mosaic::{BoundingBox, TileIdentity, TileSource};

type FailurePredicate = Arc<dyn Fn(&TileIdentity) -> bool + Send + Sync>;

// =============================================================================
// Mock Tile Source
// =============================================================================

/// A tile source that renders every tile as a solid PNG and tracks requests.
///
/// Colors are derived from tile coordinates (see [`color_for`]) so tests can
/// check where each tile landed on the canvas.
pub struct MockTileSource {
    name: String,
    max_zoom: u8,
    tile_size: u32,
    /// Tiles above this zoom answer `NotFound`
    served_zoom: u8,
    fail_when: Option<FailurePredicate>,
    delay: Duration,
    fetch_count: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockTileSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_zoom: 20,
            tile_size: 8,
            served_zoom: 20,
            fail_when: None,
            delay: Duration::ZERO,
            fetch_count: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    /// Answer `NotFound` for every tile deeper than `zoom`.
    pub fn serving_up_to(mut self, zoom: u8) -> Self {
        self.served_zoom = zoom;
        self
    }

    /// Answer HTTP 503 for tiles matching `predicate`.
    pub fn failing_when(
        mut self,
        predicate: impl Fn(&TileIdentity) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Arc::new(predicate));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Keys of every requested tile, in request order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TileSource for MockTileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    async fn fetch_tile(&self, tile: &TileIdentity) -> Result<Bytes, FetchError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(tile.key());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if tile.z() > self.served_zoom {
            return Err(FetchError::NotFound(tile.key()));
        }
        if let Some(ref fail) = self.fail_when {
            if fail(tile) {
                return Err(FetchError::Http {
                    status: 503,
                    url: tile.key(),
                });
            }
        }

        Ok(solid_png(self.tile_size, color_for(tile.x(), tile.y())))
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Opaque color encoding a tile's column and row.
pub fn color_for(col: u32, row: u32) -> Rgba<u8> {
    Rgba([(col % 251) as u8, (row % 251) as u8, 200, 255])
}

/// A PNG of one solid color.
pub fn solid_png(size: u32, color: Rgba<u8>) -> Bytes {
    let image = RgbaImage::from_pixel(size, size, color);
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).unwrap();
    Bytes::from(buffer.into_inner())
}

/// A small area around lower Manhattan spanning a few tiles at zoom 12-14.
pub fn test_bbox() -> BoundingBox {
    BoundingBox::new(40.70, -74.02, 40.75, -73.95).unwrap()
}

/// Decode a raster written by the encoder.
pub fn read_raster(path: &std::path::Path) -> RgbaImage {
    let bytes = std::fs::read(path).unwrap();
    image::load_from_memory_with_format(&bytes, ImageFormat::Tiff)
        .unwrap()
        .to_rgba8()
}
