//! Bounded-concurrency tile downloader.
//!
//! # Pipeline
//!
//! ```text
//!              ┌──────────┐
//!  job queue ─►│ worker 1 │─┐
//!      │       ├──────────┤ │   results    ┌──────────┐
//!      ├──────►│ worker 2 │─┼────────────► │ consumer │─► tile files
//!      │       ├──────────┤ │              │          │─► canvas ─► raster
//!      └──────►│ worker N │─┘              └──────────┘
//!              └──────────┘
//!                   │
//!             fetch permits (one Semaphore shared by all workers)
//! ```
//!
//! Workers pull jobs from one queue, fetch each tile cache-through under a
//! permit, decode it when a raster is wanted, and send the result to the
//! single consumer. The consumer owns the canvas and the counters, so nothing
//! it touches needs a lock.
//!
//! A failed tile is recorded and never aborts the batch. Once every job is
//! processed the success rate is checked against the configured minimum.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::RgbaImage;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::PersistentTileCache;
use crate::error::{DownloadError, FetchError, TileError, ValidationError};
use crate::format::tiff::{geokeys_for_epsg, write_preview, GeoTiffEncoder, TiffField, TiffTag};
use crate::io::write_atomic;
use crate::raster::{Canvas, GeoTransform, GridBounds};
use crate::tile::{crop_from_ancestor, decode_tile, sniff_extension, TileIdentity, TileSource};

use super::events::{
    DownloadCallbacks, EventProperties, Progress, EVENT_DOWNLOAD_COMPLETE, EVENT_DOWNLOAD_FAILED,
    EVENT_DOWNLOAD_PARTIAL,
};
use super::request::DownloadRequest;

/// Default number of worker tasks
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Default number of fetches in flight across all workers
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 16;

/// Default minimum fraction of tiles that must succeed
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.30;

/// Default raster size limit: 16384 x 16384 pixels
pub const DEFAULT_MAX_CANVAS_PIXELS: u64 = 16384 * 16384;

/// Default number of coarser zoom levels tried for historical tiles
pub const DEFAULT_MAX_FALLBACK_LEVELS: u8 = 3;

/// Default limit on the tiles one request may cover
pub const DEFAULT_MAX_TILES: u64 = 100_000;

// =============================================================================
// Configuration
// =============================================================================

/// Settings for [`BoundedDownloader`].
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Worker pool width; the pool never exceeds the tile count.
    pub max_workers: usize,

    /// Fetches in flight across the pool.
    pub max_concurrent_fetches: usize,

    /// Fraction of tiles (0.0 to 1.0) that must succeed.
    pub min_success_rate: f64,

    /// Per-fetch timeout; `None` waits as long as the source does.
    pub fetch_timeout: Option<Duration>,

    /// Largest raster, in pixels, a request may produce.
    pub max_canvas_pixels: u64,

    /// Most tiles a request may cover, in any output mode.
    pub max_tiles: u64,

    /// Root for raster files and the tile-file tree.
    pub output_dir: PathBuf,

    /// Coarser levels tried for historical tiles.
    pub max_fallback_levels: u8,
}

impl DownloaderConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            min_success_rate: DEFAULT_MIN_SUCCESS_RATE,
            fetch_timeout: None,
            max_canvas_pixels: DEFAULT_MAX_CANVAS_PIXELS,
            max_tiles: DEFAULT_MAX_TILES,
            output_dir: output_dir.into(),
            max_fallback_levels: DEFAULT_MAX_FALLBACK_LEVELS,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_max_concurrent_fetches(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = max.max(1);
        self
    }

    pub fn with_min_success_rate(mut self, rate: f64) -> Self {
        self.min_success_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn with_max_canvas_pixels(mut self, pixels: u64) -> Self {
        self.max_canvas_pixels = pixels;
        self
    }

    pub fn with_max_tiles(mut self, max_tiles: u64) -> Self {
        self.max_tiles = max_tiles.max(1);
        self
    }

    pub fn with_max_fallback_levels(mut self, levels: u8) -> Self {
        self.max_fallback_levels = levels;
        self
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self::new("downloads")
    }
}

// =============================================================================
// Jobs and results
// =============================================================================

/// One tile to fetch.
#[derive(Debug, Clone)]
struct TileJob {
    index: usize,
    identity: TileIdentity,
}

/// A fetched tile.
struct FetchedTile {
    bytes: Bytes,
    /// Zoom level the bytes were served at; below the job's zoom on fallback
    actual_zoom: u8,
    from_cache: bool,
    image: Option<RgbaImage>,
}

struct TileResult {
    job: TileJob,
    outcome: Result<FetchedTile, String>,
}

/// A tile that could not be produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTile {
    pub key: String,
    pub error: String,
}

/// Summary of a successful download.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub provider: String,
    pub zoom: u8,
    pub total: usize,
    pub succeeded: usize,
    pub cache_hits: usize,
    /// Tiles served from a coarser zoom level
    pub fallbacks: usize,
    pub failed: Vec<FailedTile>,
    pub tiles_dir: Option<PathBuf>,
    pub raster_path: Option<PathBuf>,
    pub preview_path: Option<PathBuf>,
    pub geotransform: Option<GeoTransform>,
}

impl DownloadReport {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Shared state handed to every worker.
struct WorkerContext {
    source: Arc<dyn TileSource>,
    cache: Option<Arc<PersistentTileCache>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    fetch_timeout: Option<Duration>,
    date: Option<String>,
    alternate_date: Option<String>,
    max_fallback_levels: u8,
    decode: bool,
    tile_size: u32,
}

// =============================================================================
// BoundedDownloader
// =============================================================================

/// Downloads the tiles of a bounding box with bounded concurrency and
/// assembles them into tile files and/or a georeferenced raster.
///
/// # Example
///
/// ```ignore
/// let downloader = BoundedDownloader::new(source, DownloaderConfig::new("out"))
///     .with_cache(cache);
/// let request = DownloadRequest::new(bbox, 15, OutputMode::Raster);
/// let report = downloader.download(&request, CancellationToken::new()).await?;
/// ```
pub struct BoundedDownloader {
    source: Arc<dyn TileSource>,
    cache: Option<Arc<PersistentTileCache>>,
    config: DownloaderConfig,
    callbacks: DownloadCallbacks,
    permits: Arc<Semaphore>,
}

impl BoundedDownloader {
    pub fn new(source: Arc<dyn TileSource>, config: DownloaderConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));
        Self {
            source,
            cache: None,
            config,
            callbacks: DownloadCallbacks::default(),
            permits,
        }
    }

    /// Fetch tiles cache-through.
    pub fn with_cache(mut self, cache: Arc<PersistentTileCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_callbacks(mut self, callbacks: DownloadCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Run one download to completion.
    ///
    /// Validation happens before any I/O. Individual tile failures are
    /// tolerated as long as the success rate stays at or above
    /// `min_success_rate`; below it, tile files already written are kept but
    /// no raster is produced.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<DownloadReport, DownloadError> {
        request.validate(self.source.max_zoom())?;
        let tile_size = self.source.tile_size();

        // Size limits are checked on the range before any tile list exists
        let range = self.source.tile_range(&request.bbox, request.zoom)?;
        if range.count() > self.config.max_tiles {
            return Err(ValidationError::TooManyTiles {
                count: range.count(),
                limit: self.config.max_tiles,
            }
            .into());
        }
        if request.mode.wants_raster() {
            GridBounds::from(range).check_canvas(tile_size, self.config.max_canvas_pixels)?;
        }

        let tiles = self.source.tile_grid(&request.bbox, request.zoom)?;
        let bounds = GridBounds::from_tiles(&tiles).ok_or(DownloadError::EmptyTileSet)?;

        let mut canvas = if request.mode.wants_raster() {
            bounds.check_canvas(tile_size, self.config.max_canvas_pixels)?;
            Some(Canvas::new(bounds, tile_size))
        } else {
            None
        };

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let provider = self.source.name().to_string();
        let total = tiles.len();
        let workers = self.config.max_workers.clamp(1, total);

        info!(
            provider = %provider,
            zoom = request.zoom,
            tiles = total,
            workers = workers,
            mode = %request.mode,
            "Starting download"
        );
        self.callbacks.log(&format!(
            "Downloading {} tiles from {} at zoom {}",
            total, provider, request.zoom
        ));

        // Job queue, filled up front
        let (job_tx, job_rx) = mpsc::channel(total);
        for (index, coord) in tiles.iter().enumerate() {
            let identity = TileIdentity::new(&provider, request.zoom, coord.col, coord.row)
                .with_optional_date(request.date.as_deref());
            // Capacity equals the job count, so this never waits
            if job_tx.send(TileJob { index, identity }).await.is_err() {
                return Err(DownloadError::Task("job queue closed".to_string()));
            }
        }
        drop(job_tx);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let context = Arc::new(WorkerContext {
            source: Arc::clone(&self.source),
            cache: self.cache.clone(),
            permits: Arc::clone(&self.permits),
            cancel: cancel.clone(),
            fetch_timeout: self.config.fetch_timeout,
            date: request.date.clone(),
            alternate_date: request.alternate_date.clone(),
            max_fallback_levels: self.config.max_fallback_levels,
            decode: request.mode.wants_raster(),
            tile_size,
        });

        let (result_tx, mut result_rx) = mpsc::channel::<TileResult>(workers * 2);
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(run_worker(
                Arc::clone(&context),
                Arc::clone(&job_rx),
                result_tx.clone(),
            ));
        }
        drop(result_tx);

        // Consumer
        let tiles_dir = request.mode.wants_tiles().then(|| self.config.output_dir.clone());
        let mut processed = 0usize;
        let mut succeeded = 0usize;
        let mut cache_hits = 0usize;
        let mut fallbacks = 0usize;
        let mut failed = Vec::new();

        while let Some(result) = result_rx.recv().await {
            processed += 1;
            let key = result.job.identity.key();

            let outcome = match result.outcome {
                Ok(tile) => self
                    .consume_tile(&result.job, tile, tiles_dir.as_deref(), canvas.as_mut())
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e),
            };

            let status = match outcome {
                Ok(stats) => {
                    succeeded += 1;
                    cache_hits += usize::from(stats.from_cache);
                    fallbacks += usize::from(stats.fallback);
                    format!("Downloaded {}", key)
                }
                Err(error) => {
                    debug!(key = %key, error = %error, "Tile failed");
                    let status = format!("Failed {}: {}", key, error);
                    failed.push(FailedTile { key, error });
                    status
                }
            };

            self.callbacks
                .progress(&Progress::new(processed, total, status));
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Download worker panicked");
            }
        }

        if cancel.is_cancelled() {
            info!(provider = %provider, processed = processed, "Download cancelled");
            return Err(DownloadError::Cancelled);
        }

        // Jobs lost to a panicked worker count as failures
        let failed_count = total - succeeded;
        let rate = succeeded as f64 / total as f64;

        let mut properties = EventProperties::new();
        properties.insert("provider".to_string(), provider.clone());
        properties.insert("zoom".to_string(), request.zoom.to_string());
        properties.insert("total".to_string(), total.to_string());
        properties.insert("succeeded".to_string(), succeeded.to_string());
        properties.insert("failed".to_string(), failed_count.to_string());

        if rate < self.config.min_success_rate {
            warn!(
                provider = %provider,
                succeeded = succeeded,
                total = total,
                required_rate = self.config.min_success_rate,
                "Too many tiles failed"
            );
            self.callbacks.event(EVENT_DOWNLOAD_FAILED, &properties);
            return Err(DownloadError::InsufficientSuccess {
                succeeded,
                total,
                required_rate: self.config.min_success_rate,
                last_error: failed.last().map(|f: &FailedTile| f.error.clone()),
            });
        }

        if failed_count > 0 {
            warn!(
                provider = %provider,
                succeeded = succeeded,
                failed = failed_count,
                "Download completed with missing tiles"
            );
            self.callbacks.log(&format!(
                "Warning: {} of {} tiles failed; output has gaps",
                failed_count, total
            ));
            self.callbacks.event(EVENT_DOWNLOAD_PARTIAL, &properties);
        } else {
            self.callbacks.event(EVENT_DOWNLOAD_COMPLETE, &properties);
        }

        let mut report = DownloadReport {
            provider: provider.clone(),
            zoom: request.zoom,
            total,
            succeeded,
            cache_hits,
            fallbacks,
            failed,
            tiles_dir,
            raster_path: None,
            preview_path: None,
            geotransform: None,
        };

        if let Some(canvas) = canvas {
            self.write_raster(request, canvas, &mut report).await?;
        }

        info!(
            provider = %provider,
            succeeded = report.succeeded,
            total = report.total,
            cache_hits = report.cache_hits,
            raster = ?report.raster_path,
            "Download complete"
        );

        Ok(report)
    }

    /// Persist and/or draw one successful tile.
    async fn consume_tile(
        &self,
        job: &TileJob,
        tile: FetchedTile,
        tiles_dir: Option<&Path>,
        canvas: Option<&mut Canvas>,
    ) -> Result<ConsumedTile, TileError> {
        let requested_zoom = job.identity.z();
        let levels = requested_zoom.saturating_sub(tile.actual_zoom);

        if let Some(dir) = tiles_dir {
            // Fallback bytes belong to the ancestor, so they are filed under it
            let served = job.identity.ancestor(levels).unwrap_or_else(|| job.identity.clone());
            let path = dir.join(served.relative_path(sniff_extension(&tile.bytes)));
            write_atomic(&path, &tile.bytes)
                .await
                .map_err(|e| TileError::Write {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
        }

        if let Some(canvas) = canvas {
            let image = tile.image.ok_or_else(|| TileError::DecodeError {
                message: "tile was not decoded".to_string(),
            })?;
            canvas.draw(job.identity.x(), job.identity.y(), &image);
        }

        Ok(ConsumedTile {
            from_cache: tile.from_cache,
            fallback: levels > 0,
        })
    }

    async fn write_raster(
        &self,
        request: &DownloadRequest,
        canvas: Canvas,
        report: &mut DownloadReport,
    ) -> Result<(), DownloadError> {
        let output_dir = self.config.output_dir.clone();
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| DownloadError::Io {
                path: output_dir.clone(),
                message: e.to_string(),
            })?;

        let provider = self.source.name();
        let transform = GeoTransform::for_grid(self.source.as_ref(), request.zoom, canvas.bounds());
        let path = output_dir.join(request.raster_file_name(provider));
        let preview_path = request
            .preview
            .then(|| output_dir.join(request.preview_file_name(provider)));

        let mut tags: Vec<TiffField> = request.extra_tags.clone();
        let has_geokeys = tags
            .iter()
            .any(|t| t.tag == TiffTag::GeoKeyDirectory.as_u16());
        if !has_geokeys {
            tags.extend(geokeys_for_epsg(self.source.epsg()));
        }

        let image = canvas.into_image();
        let raster_path = path.clone();
        let preview = preview_path.clone();
        tokio::task::spawn_blocking(move || {
            GeoTiffEncoder::new().encode(&image, &raster_path, &transform, &tags)?;
            if let Some(ref preview) = preview {
                write_preview(&image, preview)?;
            }
            Ok::<_, crate::error::EncodeError>(())
        })
        .await
        .map_err(|e| DownloadError::Task(e.to_string()))??;

        info!(path = %path.display(), "Raster written");
        self.callbacks
            .log(&format!("Raster written to {}", path.display()));

        report.raster_path = Some(path);
        report.preview_path = preview_path;
        report.geotransform = Some(transform);
        Ok(())
    }
}

struct ConsumedTile {
    from_cache: bool,
    fallback: bool,
}

// =============================================================================
// Workers
// =============================================================================

async fn run_worker(
    context: Arc<WorkerContext>,
    jobs: Arc<Mutex<mpsc::Receiver<TileJob>>>,
    results: mpsc::Sender<TileResult>,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };

        let outcome = if context.cancel.is_cancelled() {
            Err(FetchError::Cancelled.to_string())
        } else {
            process_job(&context, &job).await
        };

        if results.send(TileResult { job, outcome }).await.is_err() {
            break;
        }
    }
}

async fn process_job(context: &WorkerContext, job: &TileJob) -> Result<FetchedTile, String> {
    let mut tile = fetch_cache_through(context, &job.identity)
        .await
        .map_err(|e| e.to_string())?;

    if context.decode {
        let bytes = tile.bytes.clone();
        let tile_size = context.tile_size;
        let levels = job.identity.z().saturating_sub(tile.actual_zoom);
        let (col, row) = (job.identity.x(), job.identity.y());

        let image = tokio::task::spawn_blocking(move || {
            let decoded = decode_tile(&bytes, tile_size)?;
            Ok::<_, TileError>(if levels > 0 {
                crop_from_ancestor(&decoded, levels, col, row, tile_size)
            } else {
                decoded
            })
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;

        tile.image = Some(image);
    }

    debug!(index = job.index, key = %job.identity, "Tile ready");
    Ok(tile)
}

/// Fetch one tile, consulting and filling the cache when one is attached.
///
/// The fetch permit is held for the cache lookup as well as the provider
/// request. Dated tiles missing from the cache are also looked up under the
/// ancestors a fallback would have stored them as.
async fn fetch_cache_through(
    context: &WorkerContext,
    identity: &TileIdentity,
) -> Result<FetchedTile, FetchError> {
    let permit = tokio::select! {
        _ = context.cancel.cancelled() => return Err(FetchError::Cancelled),
        permit = context.permits.acquire() => permit.map_err(|_| FetchError::Cancelled)?,
    };

    if let Some(ref cache) = context.cache {
        let levels = if context.date.is_some() {
            context.max_fallback_levels
        } else {
            0
        };
        for level in 0..=levels {
            let Some(candidate) = identity.ancestor(level) else {
                break;
            };
            if let Some(bytes) = cache.get(&candidate).await {
                if level > 0 {
                    debug!(
                        key = %identity,
                        served = %candidate,
                        "Fallback tile served from cache"
                    );
                }
                return Ok(FetchedTile {
                    bytes,
                    actual_zoom: candidate.z(),
                    from_cache: true,
                    image: None,
                });
            }
        }
    }

    let fetch = async {
        match context.date {
            Some(ref date) => {
                context
                    .source
                    .fetch_historical_tile_with_fallback(
                        identity,
                        date,
                        context.alternate_date.as_deref(),
                        context.max_fallback_levels,
                    )
                    .await
            }
            None => context
                .source
                .fetch_tile(identity)
                .await
                .map(|bytes| (bytes, identity.z())),
        }
    };

    let fetched = tokio::select! {
        _ = context.cancel.cancelled() => Err(FetchError::Cancelled),
        result = with_timeout(context.fetch_timeout, fetch) => result,
    };
    drop(permit);

    let (bytes, actual_zoom) = fetched?;
    if bytes.is_empty() {
        return Err(FetchError::EmptyResponse(identity.key()));
    }

    if let Some(ref cache) = context.cache {
        let levels = identity.z().saturating_sub(actual_zoom);
        let served = identity.ancestor(levels).unwrap_or_else(|| identity.clone());
        if let Err(e) = cache.set(&served, bytes.clone()).await {
            warn!(key = %served, error = %e, "Failed to cache tile");
        }
    }

    Ok(FetchedTile {
        bytes,
        actual_zoom,
        from_cache: false,
        image: None,
    })
}

async fn with_timeout<F, T>(timeout: Option<Duration>, fut: F) -> Result<T, FetchError>
where
    F: std::future::Future<Output = Result<T, FetchError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(FetchError::Timeout(limit.as_millis() as u64))),
        None => fut.await,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::OutputMode;
    use crate::format::tiff::read_directory;
    use crate::tile::{BoundingBox, TileCoord};
    use async_trait::async_trait;
    use image::{ImageFormat, Rgba};
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed grid of solid tiles; tiles whose index is in `failing` error out.
    struct GridSource {
        tiles: Vec<TileCoord>,
        failing: HashSet<usize>,
        fetches: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl GridSource {
        fn new(count: usize, failing: &[usize]) -> Self {
            Self {
                tiles: (0..count as u32).map(|c| TileCoord::new(c, 0)).collect(),
                failing: failing.iter().copied().collect(),
                fetches: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    fn png(size: u32, value: u8) -> Bytes {
        let image = RgbaImage::from_pixel(size, size, Rgba([value, value, value, 255]));
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        Bytes::from(buffer.into_inner())
    }

    #[async_trait]
    impl TileSource for GridSource {
        fn name(&self) -> &str {
            "grid"
        }

        fn max_zoom(&self) -> u8 {
            18
        }

        fn tile_size(&self) -> u32 {
            4
        }

        fn tile_grid(&self, _bbox: &BoundingBox, _zoom: u8) -> Result<Vec<TileCoord>, FetchError> {
            Ok(self.tiles.clone())
        }

        async fn fetch_tile(&self, tile: &TileIdentity) -> Result<Bytes, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&(tile.x() as usize)) {
                Err(FetchError::Http {
                    status: 500,
                    url: tile.key(),
                })
            } else {
                Ok(png(4, tile.x() as u8 * 10))
            }
        }
    }

    fn request(mode: OutputMode) -> DownloadRequest {
        DownloadRequest::new(BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap(), 5, mode)
    }

    #[tokio::test]
    async fn test_three_of_ten_failures_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GridSource::new(10, &[1, 4, 7]));
        let downloader = BoundedDownloader::new(source, DownloaderConfig::new(dir.path()));

        let report = downloader
            .download(&request(OutputMode::Raster), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded, 7);
        assert_eq!(report.failed.len(), 3);
        assert!(report.is_partial());
        let path = report.raster_path.unwrap();
        assert!(path.exists());

        let bytes = std::fs::read(&path).unwrap();
        let ifd = read_directory(&bytes).unwrap();
        assert_eq!(ifd.u64_value(TiffTag::ImageWidth), Some(40));
        assert_eq!(ifd.u64_value(TiffTag::ImageLength), Some(4));
    }

    #[tokio::test]
    async fn test_eight_of_ten_failures_fails_without_raster() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GridSource::new(10, &[0, 1, 2, 3, 4, 5, 6, 7]));
        let downloader = BoundedDownloader::new(source, DownloaderConfig::new(dir.path()));

        let result = downloader
            .download(&request(OutputMode::Raster), CancellationToken::new())
            .await;

        match result {
            Err(DownloadError::InsufficientSuccess {
                succeeded, total, ..
            }) => {
                assert_eq!(succeeded, 2);
                assert_eq!(total, 10);
            }
            other => panic!("expected InsufficientSuccess, got {:?}", other.map(|r| r.succeeded)),
        }

        let written: Vec<_> = std::fs::read_dir(dir.path())
            .map(|d| d.flatten().collect())
            .unwrap_or_default();
        assert!(written.is_empty(), "no raster expected");
    }

    #[tokio::test]
    async fn test_configurable_success_rate() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GridSource::new(10, &[0, 1, 2, 3]));
        let config = DownloaderConfig::new(dir.path()).with_min_success_rate(0.9);
        let downloader = BoundedDownloader::new(source, config);

        let result = downloader
            .download(&request(OutputMode::Tiles), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DownloadError::InsufficientSuccess { .. })));
    }

    #[tokio::test]
    async fn test_tiles_mode_writes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GridSource::new(3, &[]));
        let downloader = BoundedDownloader::new(source, DownloaderConfig::new(dir.path()));

        let report = downloader
            .download(
                &request(OutputMode::Tiles).with_date("2021-05-01"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded, 3);
        assert!(report.raster_path.is_none());
        for col in 0..3 {
            let path = dir.path().join(format!("grid/5/{}/0_2021-05-01.png", col));
            assert!(path.exists(), "missing {}", path.display());
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = GridSource::new(20, &[]);
        source.delay = Duration::from_millis(10);
        let source = Arc::new(source);

        let config = DownloaderConfig::new(dir.path())
            .with_max_workers(8)
            .with_max_concurrent_fetches(3);
        let downloader = BoundedDownloader::new(source.clone(), config);

        downloader
            .download(&request(OutputMode::Tiles), CancellationToken::new())
            .await
            .unwrap();

        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_progress_reported_per_tile() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GridSource::new(5, &[2]));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (s, e) = (seen.clone(), events.clone());

        let callbacks = DownloadCallbacks::new()
            .on_progress(move |p| s.lock().unwrap().push(p.downloaded))
            .on_event(move |name, _| e.lock().unwrap().push(name.to_string()));
        let downloader = BoundedDownloader::new(source, DownloaderConfig::new(dir.path()))
            .with_callbacks(callbacks);

        downloader
            .download(&request(OutputMode::Tiles), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(*events.lock().unwrap(), vec![EVENT_DOWNLOAD_PARTIAL]);
    }

    #[tokio::test]
    async fn test_cancelled_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = GridSource::new(10, &[]);
        source.delay = Duration::from_secs(5);
        let downloader = BoundedDownloader::new(Arc::new(source), DownloaderConfig::new(dir.path()));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = downloader.download(&request(OutputMode::Raster), cancel).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn test_fetch_timeout_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = GridSource::new(2, &[]);
        source.delay = Duration::from_secs(5);
        let config = DownloaderConfig::new(dir.path())
            .with_fetch_timeout(Duration::from_millis(20))
            .with_min_success_rate(0.0);
        let downloader = BoundedDownloader::new(Arc::new(source), config);

        let report = downloader
            .download(&request(OutputMode::Tiles), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 0);
        assert!(report.failed[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_zoom_validated_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GridSource::new(2, &[]));
        let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(dir.path()));

        let bad = DownloadRequest::new(BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap(), 25, OutputMode::Raster);
        let result = downloader.download(&bad, CancellationToken::new()).await;

        assert!(matches!(result, Err(DownloadError::Validation(_))));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_canvas_limit_validated() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(GridSource::new(10, &[]));
        let config = DownloaderConfig::new(dir.path()).with_max_canvas_pixels(100);
        let downloader = BoundedDownloader::new(source.clone(), config);

        let result = downloader
            .download(&request(OutputMode::Raster), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DownloadError::Validation(_))));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    /// Uses the default Web Mercator grid and never serves anything.
    struct DeepSource {
        max_zoom: u8,
        fetches: AtomicUsize,
    }

    impl DeepSource {
        fn new(max_zoom: u8) -> Self {
            Self {
                max_zoom,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TileSource for DeepSource {
        fn name(&self) -> &str {
            "deep"
        }

        fn max_zoom(&self) -> u8 {
            self.max_zoom
        }

        async fn fetch_tile(&self, tile: &TileIdentity) -> Result<Bytes, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::NotFound(tile.key()))
        }
    }

    fn whole_world() -> BoundingBox {
        BoundingBox::new(-85.0, -179.9, 85.0, 179.9).unwrap()
    }

    #[tokio::test]
    async fn test_whole_world_raster_rejected_before_grid() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(DeepSource::new(21));
        let config = DownloaderConfig::new(dir.path()).with_max_tiles(u64::MAX);
        let downloader = BoundedDownloader::new(source.clone(), config);

        let request = DownloadRequest::new(whole_world(), 20, OutputMode::Raster);
        let result = downloader.download(&request, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(DownloadError::Validation(ValidationError::CanvasTooLarge { .. }))
        ));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tile_count_limited_in_tiles_mode() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(DeepSource::new(21));
        let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(dir.path()));

        let request = DownloadRequest::new(whole_world(), 20, OutputMode::Tiles);
        let result = downloader.download(&request, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(DownloadError::Validation(ValidationError::TooManyTiles { limit, .. }))
                if limit == DEFAULT_MAX_TILES
        ));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_zoom_beyond_supported_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(DeepSource::new(70));
        let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(dir.path()));

        let request = DownloadRequest::new(whole_world(), 64, OutputMode::Tiles);
        let result = downloader.download(&request, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(DownloadError::Validation(ValidationError::UnsupportedZoom { zoom: 64, .. }))
        ));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_lookup_waits_for_permit() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = PersistentTileCache::open(crate::cache::CacheConfig::new(cache_dir.path()))
            .await
            .unwrap();
        let identity = TileIdentity::new("grid", 5, 0, 0);
        cache.set(&identity, png(4, 9)).await.unwrap();

        let downloader = BoundedDownloader::new(
            Arc::new(GridSource::new(1, &[])),
            DownloaderConfig::new(dir.path()).with_max_concurrent_fetches(1),
        )
        .with_cache(Arc::clone(&cache));

        let context = WorkerContext {
            source: Arc::clone(&downloader.source),
            cache: Some(Arc::clone(&cache)),
            permits: Arc::clone(&downloader.permits),
            cancel: CancellationToken::new(),
            fetch_timeout: None,
            date: None,
            alternate_date: None,
            max_fallback_levels: 0,
            decode: false,
            tile_size: 4,
        };

        // With every permit taken, even a cached tile waits
        let held = downloader.permits.clone().acquire_owned().await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            fetch_cache_through(&context, &identity),
        )
        .await;
        assert!(blocked.is_err());

        drop(held);
        let tile = fetch_cache_through(&context, &identity).await.unwrap();
        assert!(tile.from_cache);

        cache.shutdown().await.unwrap();
    }
}
