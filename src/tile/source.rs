//! Tile source abstraction.
//!
//! A [`TileSource`] knows how a provider lays out its tile grid and how to
//! fetch the bytes of one tile. Provider-specific URL signing, decryption or
//! date lookup lives behind this trait; the downloader only sees identities
//! and bytes.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::FetchError;

use super::grid::{
    web_mercator_corner, web_mercator_range, BoundingBox, TileCoord, TileRange,
    MAX_SUPPORTED_ZOOM,
};
use super::identity::TileIdentity;

/// Edge length in pixels of a standard web map tile.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// EPSG code of the projection used by all XYZ/TMS providers.
pub const DEFAULT_EPSG: u32 = 3857;

/// A provider of map tiles.
///
/// Only [`name`](Self::name), [`max_zoom`](Self::max_zoom) and
/// [`fetch_tile`](Self::fetch_tile) are required. The grid and projection
/// defaults implement the spherical Web Mercator TMS scheme.
///
/// # Example
///
/// ```ignore
/// use tile_mosaic::tile::{TileSource, TileIdentity};
///
/// async fn first_tile<S: TileSource>(source: &S) -> Result<Bytes, FetchError> {
///     source.fetch_tile(&TileIdentity::new(source.name(), 0, 0, 0)).await
/// }
/// ```
#[async_trait]
pub trait TileSource: Send + Sync {
    /// Provider name, used as the first component of tile identities.
    fn name(&self) -> &str;

    /// Highest zoom level the provider serves.
    fn max_zoom(&self) -> u8;

    /// Tile edge length in pixels.
    fn tile_size(&self) -> u32 {
        DEFAULT_TILE_SIZE
    }

    /// EPSG code of the projected coordinates returned by
    /// [`tile_to_projected`](Self::tile_to_projected).
    fn epsg(&self) -> u32 {
        DEFAULT_EPSG
    }

    /// Column and row range of the tiles intersecting `bbox` at `zoom`.
    ///
    /// Must cover every tile [`tile_grid`](Self::tile_grid) returns. Used to
    /// check size limits before the tile list is built.
    fn tile_range(&self, bbox: &BoundingBox, zoom: u8) -> Result<TileRange, FetchError> {
        let max = self.max_zoom().min(MAX_SUPPORTED_ZOOM);
        if zoom > max {
            return Err(FetchError::Grid(format!(
                "zoom {} above supported maximum {}",
                zoom, max
            )));
        }
        Ok(web_mercator_range(bbox, zoom))
    }

    /// Tiles intersecting `bbox` at `zoom`.
    fn tile_grid(&self, bbox: &BoundingBox, zoom: u8) -> Result<Vec<TileCoord>, FetchError> {
        Ok(self.tile_range(bbox, zoom)?.tiles())
    }

    /// Projected coordinate of the south-west corner of `(row, col)`.
    fn tile_to_projected(&self, zoom: u8, row: u32, col: u32) -> (f64, f64) {
        web_mercator_corner(zoom, row, col)
    }

    /// Fetch the raw encoded bytes of one tile.
    async fn fetch_tile(&self, tile: &TileIdentity) -> Result<Bytes, FetchError>;

    /// Fetch a historical tile, walking up to coarser zoom levels when the
    /// requested one has no imagery for the date.
    ///
    /// At each level `date` is tried first, then `alternate_date` (a second
    /// encoding of the same date some providers expect). Returns the bytes and
    /// the zoom level they were actually served at; when that is lower than
    /// `tile.z()`, the bytes cover the ancestor tile.
    ///
    /// Only "no imagery here" failures trigger a fallback. Any other error is
    /// returned immediately.
    async fn fetch_historical_tile_with_fallback(
        &self,
        tile: &TileIdentity,
        date: &str,
        alternate_date: Option<&str>,
        max_fallback_levels: u8,
    ) -> Result<(Bytes, u8), FetchError> {
        let mut last_error = FetchError::NotFound(tile.key());

        for level in 0..=max_fallback_levels {
            let Some(ancestor) = tile.ancestor(level) else {
                break;
            };

            let dates = std::iter::once(date).chain(alternate_date);
            for candidate_date in dates {
                let candidate = ancestor.clone().with_date(candidate_date);
                match self.fetch_tile(&candidate).await {
                    Ok(bytes) => {
                        if level > 0 {
                            debug!(
                                tile = %tile,
                                served_zoom = candidate.z(),
                                "Historical tile served from lower zoom"
                            );
                        }
                        return Ok((bytes, candidate.z()));
                    }
                    Err(e) if e.is_unavailable() => last_error = e,
                    Err(e) => return Err(e),
                }
            }
        }

        Err(last_error)
    }
}
