//! # tile-mosaic
//!
//! Fetch imagery tiles, including historical imagery, through a persistent
//! disk cache and assemble them into georeferenced rasters.
//!
//! ## Features
//!
//! - **Bounded downloads**: A worker pool and a shared fetch semaphore cap concurrency
//! - **Partial-failure tolerance**: Failed tiles leave gaps; the batch fails only below a minimum success rate
//! - **Persistent cache**: Tiles survive restarts, bounded by size and age, with a crash-safe index
//! - **GeoTIFF output**: A self-contained encoder writes RGBA rasters with model transform and GeoKeys
//!
//! ## Architecture
//!
//! - [`tile`] - Tile identities, the Web Mercator grid and tile sources
//! - [`cache`] - Persistent disk cache with background eviction
//! - [`download`] - Bounded downloader, requests and progress callbacks
//! - [`raster`] - Canvas assembly and geotransforms
//! - [`mod@format`] - TIFF directory reader and GeoTIFF encoder
//! - [`io`] - Atomic file writes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tile_mosaic::{
//!     BoundedDownloader, BoundingBox, CacheConfig, DownloadRequest, DownloaderConfig,
//!     HttpTileSource, OutputMode, PersistentTileCache,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = HttpTileSource::new("esri", "https://tiles.example.com/{z}/{y}/{x}", 19)?;
//!     let cache = PersistentTileCache::open(CacheConfig::new("tile_cache")).await?;
//!
//!     let downloader = BoundedDownloader::new(Arc::new(source), DownloaderConfig::new("out"))
//!         .with_cache(cache.clone());
//!
//!     let bbox = BoundingBox::new(40.70, -74.02, 40.72, -74.00)?;
//!     let request = DownloadRequest::new(bbox, 16, OutputMode::Raster);
//!     let report = downloader.download(&request, CancellationToken::new()).await?;
//!     println!("{} of {} tiles", report.succeeded, report.total);
//!
//!     cache.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod format;
pub mod io;
pub mod raster;
pub mod tile;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheStats, EvictionReport, PersistentTileCache};
pub use config::{CacheCommand, Cli, Command, DownloadConfig, InspectConfig};
pub use download::{
    BoundedDownloader, DownloadCallbacks, DownloadReport, DownloadRequest, DownloaderConfig,
    OutputMode, Progress,
};
pub use error::{
    CacheError, DownloadError, EncodeError, FetchError, TiffError, TileError, ValidationError,
};
pub use format::tiff::{
    geokeys_for_epsg, read_directory, web_mercator_geokeys, GeoTiffEncoder, Ifd, TagValue,
    TiffField, TiffTag,
};
pub use raster::{Canvas, GeoTransform, GridBounds};
pub use tile::{BoundingBox, HttpTileSource, TileCoord, TileIdentity, TileSource};
