//! Canvas assembly.
//!
//! Tiles are drawn onto one RGBA canvas at offsets derived from their grid
//! position. Rows are TMS rows (increasing north) while canvas rows grow
//! downwards, so the northernmost row lands at the top:
//!
//! ```text
//! canvas_x = (col - min_col) * tile_size
//! canvas_y = (max_row - row) * tile_size
//! ```

use image::{imageops, RgbaImage};

use crate::error::ValidationError;
use crate::tile::{TileCoord, TileRange};

/// Inclusive column and row range covered by a tile set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridBounds {
    pub min_col: u32,
    pub max_col: u32,
    pub min_row: u32,
    pub max_row: u32,
}

impl GridBounds {
    /// Bounds of `tiles`, or `None` for an empty set.
    pub fn from_tiles(tiles: &[TileCoord]) -> Option<Self> {
        let first = tiles.first()?;
        let mut bounds = Self {
            min_col: first.col,
            max_col: first.col,
            min_row: first.row,
            max_row: first.row,
        };
        for tile in &tiles[1..] {
            bounds.min_col = bounds.min_col.min(tile.col);
            bounds.max_col = bounds.max_col.max(tile.col);
            bounds.min_row = bounds.min_row.min(tile.row);
            bounds.max_row = bounds.max_row.max(tile.row);
        }
        Some(bounds)
    }

    pub fn cols(&self) -> u32 {
        self.max_col - self.min_col + 1
    }

    pub fn rows(&self) -> u32 {
        self.max_row - self.min_row + 1
    }

    /// Canvas width and height in pixels, widened to avoid overflow.
    pub fn canvas_size(&self, tile_size: u32) -> (u64, u64) {
        (
            self.cols() as u64 * tile_size as u64,
            self.rows() as u64 * tile_size as u64,
        )
    }

    /// Pixel offset of a tile's top-left corner on the canvas.
    pub fn placement(&self, col: u32, row: u32, tile_size: u32) -> (u32, u32) {
        (
            (col - self.min_col) * tile_size,
            (self.max_row - row) * tile_size,
        )
    }

    /// Reject canvases larger than `limit` pixels or wider than `u32`.
    pub fn check_canvas(&self, tile_size: u32, limit: u64) -> Result<(), ValidationError> {
        let (width, height) = self.canvas_size(tile_size);
        let too_large = width.saturating_mul(height) > limit
            || width > u32::MAX as u64
            || height > u32::MAX as u64;
        if too_large {
            return Err(ValidationError::CanvasTooLarge {
                width,
                height,
                limit,
            });
        }
        Ok(())
    }
}

impl From<TileRange> for GridBounds {
    fn from(range: TileRange) -> Self {
        Self {
            min_col: range.min_col,
            max_col: range.max_col,
            min_row: range.min_row,
            max_row: range.max_row,
        }
    }
}

/// A transparent canvas with the tiles of one grid drawn on it.
pub struct Canvas {
    bounds: GridBounds,
    tile_size: u32,
    image: RgbaImage,
    tiles_drawn: usize,
}

impl Canvas {
    /// Allocate a fully transparent canvas for `bounds`.
    ///
    /// Call [`GridBounds::check_canvas`] first; dimensions are truncated to
    /// `u32` here.
    pub fn new(bounds: GridBounds, tile_size: u32) -> Self {
        let (width, height) = bounds.canvas_size(tile_size);
        Self {
            bounds,
            tile_size,
            image: RgbaImage::new(width as u32, height as u32),
            tiles_drawn: 0,
        }
    }

    pub fn bounds(&self) -> &GridBounds {
        &self.bounds
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn tiles_drawn(&self) -> usize {
        self.tiles_drawn
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Draw a decoded tile at its grid position.
    ///
    /// Tiles outside the bounds are ignored. Pixels are copied, not blended.
    pub fn draw(&mut self, col: u32, row: u32, tile: &RgbaImage) -> bool {
        let b = &self.bounds;
        if col < b.min_col || col > b.max_col || row < b.min_row || row > b.max_row {
            return false;
        }
        let (x, y) = b.placement(col, row, self.tile_size);
        imageops::replace(&mut self.image, tile, x as i64, y as i64);
        self.tiles_drawn += 1;
        true
    }
}
