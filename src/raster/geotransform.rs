//! Pixel-to-projected affine mapping for an assembled canvas.

use serde::Serialize;

use crate::tile::TileSource;

use super::canvas::GridBounds;

/// Maps pixel `(col, row)` to projected `(origin_x + col * pixel_width,
/// origin_y + row * pixel_height)`.
///
/// The origin is the north-west corner of the canvas; `pixel_height` is
/// negative because projected Y decreases as pixel rows go down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Geotransform of a canvas covering `bounds` at `zoom`.
    ///
    /// Evaluates the source's projection at the canvas's north-west corner
    /// `(max_row + 1, min_col)` and south-east corner `(min_row, max_col + 1)`.
    pub fn for_grid<S: TileSource + ?Sized>(source: &S, zoom: u8, bounds: &GridBounds) -> Self {
        let (width, height) = bounds.canvas_size(source.tile_size());
        let (origin_x, origin_y) = source.tile_to_projected(zoom, bounds.max_row + 1, bounds.min_col);
        let (far_x, far_y) = source.tile_to_projected(zoom, bounds.min_row, bounds.max_col + 1);

        Self {
            origin_x,
            origin_y,
            pixel_width: (far_x - origin_x) / width as f64,
            pixel_height: (far_y - origin_y) / height as f64,
        }
    }

    /// Projected coordinate of the top-left corner of pixel `(col, row)`.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y + row * self.pixel_height,
        )
    }
}
