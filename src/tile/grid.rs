//! Web Mercator tile grid math.
//!
//! Provides conversions between geographic bounding boxes, tile coordinates
//! and projected (EPSG:3857) meters. Rows are TMS rows: 0 at the south edge,
//! increasing northwards.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Web Mercator valid latitude range
pub const MAX_LATITUDE: f64 = 85.05112878;
pub const MIN_LATITUDE: f64 = -85.05112878;

/// Valid longitude range
pub const MAX_LONGITUDE: f64 = 180.0;
pub const MIN_LONGITUDE: f64 = -180.0;

/// Spherical Mercator earth radius in meters.
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Deepest zoom level handled anywhere in the crate.
///
/// At zoom 30 the grid is 2^30 tiles wide, so columns and rows still fit in
/// `u32` with room for the far-edge corner at `n`.
pub const MAX_SUPPORTED_ZOOM: u8 = 30;

// =============================================================================
// BoundingBox
// =============================================================================

/// Geographic area in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Create and validate a bounding box.
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Result<Self, ValidationError> {
        let bbox = Self {
            south,
            west,
            north,
            east,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    /// Check the box is finite, inside the projectable range and non-empty.
    ///
    /// Boxes crossing the antimeridian (west > east) are rejected.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let all = [self.south, self.west, self.north, self.east];
        if all.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::InvalidBoundingBox(
                "coordinates must be finite numbers".to_string(),
            ));
        }

        for lat in [self.south, self.north] {
            if !(MIN_LATITUDE..=MAX_LATITUDE).contains(&lat) {
                return Err(ValidationError::InvalidBoundingBox(format!(
                    "latitude {} outside {}..={}",
                    lat, MIN_LATITUDE, MAX_LATITUDE
                )));
            }
        }

        for lon in [self.west, self.east] {
            if !(MIN_LONGITUDE..=MAX_LONGITUDE).contains(&lon) {
                return Err(ValidationError::InvalidBoundingBox(format!(
                    "longitude {} outside {}..={}",
                    lon, MIN_LONGITUDE, MAX_LONGITUDE
                )));
            }
        }

        if self.south >= self.north {
            return Err(ValidationError::InvalidBoundingBox(format!(
                "south {} must be less than north {}",
                self.south, self.north
            )));
        }

        if self.west >= self.east {
            return Err(ValidationError::InvalidBoundingBox(format!(
                "west {} must be less than east {}",
                self.west, self.east
            )));
        }

        Ok(())
    }
}

// =============================================================================
// TileCoord
// =============================================================================

/// Column and TMS row of a tile at some zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    /// X coordinate (east-west), 0 at west
    pub col: u32,
    /// Y coordinate (south-north), 0 at south
    pub row: u32,
}

impl TileCoord {
    pub fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

/// Number of tiles along one axis at `zoom`.
///
/// Expects `zoom <= MAX_SUPPORTED_ZOOM`; larger values saturate instead of
/// overflowing.
#[inline]
pub fn tiles_per_axis(zoom: u8) -> u64 {
    1u64.checked_shl(zoom as u32).unwrap_or(u64::MAX)
}

/// Convert between TMS and XYZ (top-origin) rows. The mapping is its own inverse.
#[inline]
pub fn flip_row(zoom: u8, row: u32) -> u32 {
    (tiles_per_axis(zoom) - 1 - row as u64) as u32
}

/// Column containing `lon` at `zoom`.
pub fn lon_to_col(lon: f64, zoom: u8) -> u32 {
    let n = tiles_per_axis(zoom) as f64;
    let col = ((lon + 180.0) / 360.0 * n).floor();
    col.clamp(0.0, n - 1.0) as u32
}

/// TMS row containing `lat` at `zoom`.
pub fn lat_to_row(lat: f64, zoom: u8) -> u32 {
    let n = tiles_per_axis(zoom) as f64;
    let lat_rad = lat.to_radians();
    let xyz_row = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n).floor();
    let xyz_row = xyz_row.clamp(0.0, n - 1.0) as u32;
    flip_row(zoom, xyz_row)
}

// =============================================================================
// TileRange
// =============================================================================

/// Inclusive column and row range of the tiles covering an area.
///
/// Cheap to compute for any area, so limits can be checked before the tile
/// list itself is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub min_col: u32,
    pub max_col: u32,
    pub min_row: u32,
    pub max_row: u32,
}

impl TileRange {
    pub fn cols(&self) -> u64 {
        (self.max_col - self.min_col) as u64 + 1
    }

    pub fn rows(&self) -> u64 {
        (self.max_row - self.min_row) as u64 + 1
    }

    /// Number of tiles in the range.
    pub fn count(&self) -> u64 {
        self.cols() * self.rows()
    }

    /// Every tile in the range, north row first, west to east.
    pub fn tiles(&self) -> Vec<TileCoord> {
        let mut tiles = Vec::with_capacity(self.count() as usize);
        for row in (self.min_row..=self.max_row).rev() {
            for col in self.min_col..=self.max_col {
                tiles.push(TileCoord::new(col, row));
            }
        }
        tiles
    }
}

/// Range of tiles intersecting `bbox` at `zoom`.
pub fn web_mercator_range(bbox: &BoundingBox, zoom: u8) -> TileRange {
    TileRange {
        min_col: lon_to_col(bbox.west, zoom),
        max_col: lon_to_col(bbox.east, zoom),
        min_row: lat_to_row(bbox.south, zoom),
        max_row: lat_to_row(bbox.north, zoom),
    }
}

/// All tiles intersecting `bbox` at `zoom`, north row first, west to east.
pub fn web_mercator_grid(bbox: &BoundingBox, zoom: u8) -> Vec<TileCoord> {
    web_mercator_range(bbox, zoom).tiles()
}

/// Projected coordinate of the south-west corner of tile `(row, col)`.
///
/// Accepts `row == n` and `col == n` so callers can address the far edges of
/// the grid.
pub fn web_mercator_corner(zoom: u8, row: u32, col: u32) -> (f64, f64) {
    let half = PI * EARTH_RADIUS;
    let tile_span = 2.0 * half / tiles_per_axis(zoom) as f64;
    let x = col as f64 * tile_span - half;
    let y = row as f64 * tile_span - half;
    (x, y)
}
