//! Tiles: naming, grid math, sources and decoding.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           BoundedDownloader             │
//! └──────────┬──────────────────┬───────────┘
//!            │ identities       │ bytes
//!            ▼                  ▼
//! ┌───────────────────┐ ┌───────────────────┐
//! │    TileSource     │ │  decode_tile /    │
//! │  (grid, fetch,    │ │  crop_from_       │
//! │   fallback)       │ │  ancestor         │
//! └───────────────────┘ └───────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileIdentity`]: normalized `(provider, z, x, y, date)` name, cache key and path
//! - [`BoundingBox`], [`TileCoord`]: request area and grid positions
//! - [`TileSource`]: provider abstraction with Web Mercator defaults
//! - [`HttpTileSource`]: URL-template implementation over `reqwest`
//! - [`decode_tile`], [`crop_from_ancestor`]: bytes to RGBA tiles

mod decoder;
mod grid;
mod http;
mod identity;
mod source;

pub use decoder::{crop_from_ancestor, decode_tile};
pub use grid::{
    flip_row, lat_to_row, lon_to_col, tiles_per_axis, web_mercator_corner, web_mercator_grid,
    web_mercator_range, BoundingBox, TileCoord, TileRange, EARTH_RADIUS, MAX_LATITUDE,
    MAX_LONGITUDE, MAX_SUPPORTED_ZOOM, MIN_LATITUDE, MIN_LONGITUDE,
};
pub use http::{HttpTileSource, DEFAULT_HTTP_TIMEOUT_SECS};
pub use identity::{sanitize_date, sniff_extension, TileIdentity, DEFAULT_EXTENSION};
pub use source::{TileSource, DEFAULT_EPSG, DEFAULT_TILE_SIZE};
