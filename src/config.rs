//! Command-line configuration for tile-mosaic.
//!
//! Options can be given as flags or through environment variables with the
//! `MOSAIC_` prefix:
//!
//! - `MOSAIC_TEMPLATE` - Tile URL template with `{z}`, `{x}`, `{y}` and optional `{date}`
//! - `MOSAIC_PROVIDER` - Provider name used in cache keys and file names (default: esri)
//! - `MOSAIC_MAX_ZOOM` - Deepest zoom level the provider serves (default: 19)
//! - `MOSAIC_OUTPUT_DIR` - Where rasters and tile trees are written (default: downloads)
//! - `MOSAIC_CACHE_DIR` - Disk cache root (default: tile_cache)
//! - `MOSAIC_CACHE_MAX_MB` - Disk cache size bound in MiB (default: 1024)
//! - `MOSAIC_CACHE_TTL_HOURS` - Entry lifetime in hours, 0 disables expiry (default: 720)
//! - `MOSAIC_WORKERS` - Worker tasks per download (default: 8)
//! - `MOSAIC_MAX_FETCHES` - Fetches in flight per download (default: 16)
//! - `MOSAIC_MIN_SUCCESS_RATE` - Fraction of tiles that must succeed (default: 0.3)
//! - `MOSAIC_MAX_TILES` - Most tiles a single download may cover (default: 100000)
//! - `MOSAIC_TIMEOUT_SECS` - Per-fetch timeout in seconds (default: 30)
//!
//! # Example
//!
//! ```text
//! tile-mosaic download --bbox 40.70,-74.02,40.72,-74.00 --zoom 16 \
//!     --template 'https://tiles.example.com/{date}/{z}/{y}/{x}' --date 2020-01-15
//! tile-mosaic cache stats --json
//! tile-mosaic inspect downloads/esri_2020-01-15_z16_....tif
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::cache::{CacheConfig, DEFAULT_CACHE_MAX_BYTES, DEFAULT_CACHE_TTL};
use crate::download::{
    DownloaderConfig, OutputMode, DEFAULT_MAX_CONCURRENT_FETCHES, DEFAULT_MAX_FALLBACK_LEVELS,
    DEFAULT_MAX_TILES, DEFAULT_MAX_WORKERS, DEFAULT_MIN_SUCCESS_RATE,
};
use crate::tile::{BoundingBox, DEFAULT_HTTP_TIMEOUT_SECS, MAX_SUPPORTED_ZOOM};

// =============================================================================
// Default Values
// =============================================================================

/// Default provider name.
pub const DEFAULT_PROVIDER: &str = "esri";

/// Default deepest zoom level.
pub const DEFAULT_MAX_ZOOM: u8 = 19;

/// Default output directory.
pub const DEFAULT_OUTPUT_DIR: &str = "downloads";

/// Default cache directory.
pub const DEFAULT_CACHE_DIR: &str = "tile_cache";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Default cache bound in MiB.
pub const DEFAULT_CACHE_MAX_MB: u64 = DEFAULT_CACHE_MAX_BYTES / BYTES_PER_MB;

/// Default entry lifetime in hours.
pub const DEFAULT_CACHE_TTL_HOURS: u64 = DEFAULT_CACHE_TTL.as_secs() / 3600;

// =============================================================================
// CLI Arguments
// =============================================================================

/// tile-mosaic - Fetch imagery tiles and assemble georeferenced rasters.
#[derive(Parser, Debug, Clone)]
#[command(name = "tile-mosaic")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download the tiles covering a bounding box.
    Download(DownloadConfig),

    /// Inspect or clear the disk cache.
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Print the tag directory of a TIFF file.
    Inspect(InspectConfig),
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommand {
    /// Show entry count and size.
    Stats(CacheStatsConfig),

    /// Delete every cached tile.
    Clear(CacheDirArgs),
}

/// Cache location and bounds, shared by every subcommand that opens the cache.
#[derive(Args, Debug, Clone)]
pub struct CacheDirArgs {
    /// Disk cache root.
    #[arg(long, default_value = DEFAULT_CACHE_DIR, env = "MOSAIC_CACHE_DIR")]
    pub cache_dir: PathBuf,

    /// Cache size bound in MiB.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_MB, env = "MOSAIC_CACHE_MAX_MB")]
    pub cache_max_mb: u64,

    /// Entry lifetime in hours; 0 keeps entries until evicted for space.
    #[arg(long, default_value_t = DEFAULT_CACHE_TTL_HOURS, env = "MOSAIC_CACHE_TTL_HOURS")]
    pub cache_ttl_hours: u64,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CacheDirArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_max_mb == 0 {
            return Err("cache_max_mb must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(&self.cache_dir)
            .with_max_size_bytes(self.cache_max_mb.saturating_mul(BYTES_PER_MB))
            .with_ttl(Duration::from_secs(self.cache_ttl_hours.saturating_mul(3600)))
    }
}

#[derive(Args, Debug, Clone)]
pub struct CacheStatsConfig {
    #[command(flatten)]
    pub cache: CacheDirArgs,

    /// Print JSON instead of text.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    /// TIFF file to read.
    pub file: PathBuf,

    /// Print JSON instead of text.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DownloadConfig {
    // =========================================================================
    // Area
    // =========================================================================
    /// Bounding box as `south,west,north,east` in degrees.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub bbox: Vec<f64>,

    /// Zoom level.
    #[arg(short, long)]
    pub zoom: u8,

    /// What to produce.
    #[arg(long, value_enum, default_value_t = OutputMode::Raster)]
    pub mode: OutputMode,

    // =========================================================================
    // Provider
    // =========================================================================
    /// Tile URL template with `{z}`, `{x}`, `{y}` and optionally `{date}`.
    #[arg(long, env = "MOSAIC_TEMPLATE")]
    pub template: String,

    /// Provider name used in cache keys and file names.
    #[arg(long, default_value = DEFAULT_PROVIDER, env = "MOSAIC_PROVIDER")]
    pub provider: String,

    /// Deepest zoom level the provider serves.
    #[arg(long, default_value_t = DEFAULT_MAX_ZOOM, env = "MOSAIC_MAX_ZOOM")]
    pub max_zoom: u8,

    /// Historical imagery date; omit for current imagery.
    #[arg(long)]
    pub date: Option<String>,

    /// Second encoding of the date tried before falling back a zoom level.
    #[arg(long)]
    pub alternate_date: Option<String>,

    /// Coarser zoom levels tried when a dated tile is missing.
    #[arg(long, default_value_t = DEFAULT_MAX_FALLBACK_LEVELS)]
    pub fallback_levels: u8,

    /// Per-fetch timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_HTTP_TIMEOUT_SECS, env = "MOSAIC_TIMEOUT_SECS")]
    pub timeout_secs: u64,

    // =========================================================================
    // Output
    // =========================================================================
    /// Where rasters and tile trees are written.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR, env = "MOSAIC_OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Also write a plain TIFF preview of the raster.
    #[arg(long, default_value_t = false)]
    pub preview: bool,

    /// Print the report as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    // =========================================================================
    // Concurrency
    // =========================================================================
    /// Worker tasks.
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS, env = "MOSAIC_WORKERS")]
    pub workers: usize,

    /// Fetches in flight across all workers.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_FETCHES, env = "MOSAIC_MAX_FETCHES")]
    pub max_fetches: usize,

    /// Fraction of tiles (0.0 to 1.0) that must succeed.
    #[arg(long, default_value_t = DEFAULT_MIN_SUCCESS_RATE, env = "MOSAIC_MIN_SUCCESS_RATE")]
    pub min_success_rate: f64,

    /// Most tiles a single download may cover.
    #[arg(long, default_value_t = DEFAULT_MAX_TILES, env = "MOSAIC_MAX_TILES")]
    pub max_tiles: u64,

    // =========================================================================
    // Cache
    // =========================================================================
    #[command(flatten)]
    pub cache: CacheDirArgs,

    /// Fetch straight from the provider without the disk cache.
    #[arg(long, default_value_t = false)]
    pub no_cache: bool,
}

impl DownloadConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.bbox.len() != 4 {
            return Err("bbox needs four values: south,west,north,east".to_string());
        }
        if self.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(format!(
                "max_zoom {} exceeds the supported maximum of {}",
                self.max_zoom, MAX_SUPPORTED_ZOOM
            ));
        }
        if self.zoom > self.max_zoom {
            return Err(format!(
                "zoom {} exceeds the provider maximum of {}",
                self.zoom, self.max_zoom
            ));
        }
        if self.template.trim().is_empty() {
            return Err("Tile URL template is required. Set --template or MOSAIC_TEMPLATE".to_string());
        }
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        if self.max_fetches == 0 {
            return Err("max_fetches must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err("min_success_rate must be between 0.0 and 1.0".to_string());
        }
        if self.max_tiles == 0 {
            return Err("max_tiles must be greater than 0".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("timeout_secs must be greater than 0".to_string());
        }
        if !self.no_cache {
            self.cache.validate()?;
        }
        self.bounding_box()?;
        Ok(())
    }

    pub fn bounding_box(&self) -> Result<BoundingBox, String> {
        match self.bbox.as_slice() {
            [south, west, north, east] => {
                BoundingBox::new(*south, *west, *north, *east).map_err(|e| e.to_string())
            }
            _ => Err("bbox needs four values: south,west,north,east".to_string()),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig::new(&self.output_dir)
            .with_max_workers(self.workers)
            .with_max_concurrent_fetches(self.max_fetches)
            .with_min_success_rate(self.min_success_rate)
            .with_fetch_timeout(self.fetch_timeout())
            .with_max_fallback_levels(self.fallback_levels)
            .with_max_tiles(self.max_tiles)
    }
}

// =============================================================================
// Tests
// =============================================================================
