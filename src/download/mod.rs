//! Tile downloads.
//!
//! A [`DownloadRequest`] names an area, a zoom level and an [`OutputMode`].
//! [`BoundedDownloader`] fetches the covering tiles from a
//! [`TileSource`](crate::tile::TileSource) with bounded concurrency, optionally
//! through a [`PersistentTileCache`](crate::cache::PersistentTileCache), and
//! writes tile files, a georeferenced raster, or both.

mod downloader;
mod events;
mod request;

pub use downloader::{
    BoundedDownloader, DownloadReport, DownloaderConfig, FailedTile, DEFAULT_MAX_CANVAS_PIXELS,
    DEFAULT_MAX_CONCURRENT_FETCHES, DEFAULT_MAX_FALLBACK_LEVELS, DEFAULT_MAX_TILES,
    DEFAULT_MAX_WORKERS, DEFAULT_MIN_SUCCESS_RATE,
};
pub use events::{
    DownloadCallbacks, EventProperties, Progress, EVENT_DOWNLOAD_COMPLETE, EVENT_DOWNLOAD_FAILED,
    EVENT_DOWNLOAD_PARTIAL,
};
pub use request::{DownloadRequest, OutputMode};
