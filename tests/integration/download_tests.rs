//! End-to-end download tests.
//!
//! Tests verify:
//! - Tiles land on the canvas with the northernmost row on top
//! - Rasters carry the geotransform and GeoKeys of the grid
//! - Failed tiles leave transparent gaps until the success rate is too low
//! - Historical tiles fall back to coarser zoom levels
//! - Tile trees are written for the tiles and both modes

use std::sync::Arc;

use image::Rgba;
use tokio_util::sync::CancellationToken;

use tile_mosaic::download::{BoundedDownloader, DownloadRequest, DownloaderConfig, OutputMode};
use tile_mosaic::error::DownloadError;
use tile_mosaic::raster::GridBounds;
use tile_mosaic::{read_directory, TileSource, TiffTag};

use super::test_utils::{color_for, read_raster, test_bbox, MockTileSource};

const ZOOM: u8 = 14;

fn grid_of(source: &MockTileSource, zoom: u8) -> GridBounds {
    let tiles = source.tile_grid(&test_bbox(), zoom).unwrap();
    GridBounds::from_tiles(&tiles).unwrap()
}

fn count_files(dir: &std::path::Path) -> usize {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(path) = stack.pop() {
        for entry in std::fs::read_dir(&path).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                count += 1;
            }
        }
    }
    count
}

// =============================================================================
// Raster Assembly
// =============================================================================

#[tokio::test]
async fn test_raster_places_north_row_on_top() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockTileSource::new("mock");
    let bounds = grid_of(&source, ZOOM);
    assert!(bounds.rows() > 1 && bounds.cols() > 1, "need a 2D grid");

    let downloader = BoundedDownloader::new(Arc::new(source), DownloaderConfig::new(dir.path()));
    let request = DownloadRequest::new(test_bbox(), ZOOM, OutputMode::Raster);
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, report.total);
    assert_eq!(report.total, (bounds.cols() * bounds.rows()) as usize);

    let raster = read_raster(report.raster_path.as_ref().unwrap());
    assert_eq!(raster.width(), bounds.cols() * 8);
    assert_eq!(raster.height(), bounds.rows() * 8);

    // Top-left is the north-west tile, bottom-right the south-east tile
    assert_eq!(raster.get_pixel(0, 0), &color_for(bounds.min_col, bounds.max_row));
    assert_eq!(
        raster.get_pixel(raster.width() - 1, raster.height() - 1),
        &color_for(bounds.max_col, bounds.min_row)
    );
}

#[tokio::test]
async fn test_raster_georeferencing() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = BoundedDownloader::new(
        Arc::new(MockTileSource::new("mock")),
        DownloaderConfig::new(dir.path()),
    );
    let request = DownloadRequest::new(test_bbox(), ZOOM, OutputMode::Raster);
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    let gt = report.geotransform.unwrap();
    assert!(gt.pixel_width > 0.0);
    assert!(gt.pixel_height < 0.0);
    assert!((gt.pixel_width + gt.pixel_height).abs() < 1e-6);

    let bytes = std::fs::read(report.raster_path.unwrap()).unwrap();
    let ifd = read_directory(&bytes).unwrap();

    let tiepoint = ifd.value(TiffTag::ModelTiepoint).unwrap().as_doubles().unwrap();
    assert_eq!(tiepoint, &[0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0]);

    let scale = ifd.value(TiffTag::ModelPixelScale).unwrap().as_doubles().unwrap();
    assert_eq!(scale[0], gt.pixel_width);
    assert_eq!(scale[1], -gt.pixel_height);

    // Web Mercator GeoKeys are added by default
    assert!(ifd.get(TiffTag::GeoKeyDirectory.as_u16()).is_some());
    assert!(ifd.get(TiffTag::GeoAsciiParams.as_u16()).is_some());

    let tags = ifd.tags();
    let mut sorted = tags.clone();
    sorted.sort_unstable();
    assert_eq!(tags, sorted);
}

#[tokio::test]
async fn test_raster_file_name_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = BoundedDownloader::new(
        Arc::new(MockTileSource::new("Mock")),
        DownloaderConfig::new(dir.path()),
    );
    let request =
        DownloadRequest::new(test_bbox(), 12, OutputMode::Raster).with_date("2019/06/01");
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    let path = report.raster_path.unwrap();
    assert_eq!(path, dir.path().join(request.raster_file_name("Mock")));
    assert!(path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("mock_2019-06-01_z12_"));
}

#[tokio::test]
async fn test_preview_written_alongside() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = BoundedDownloader::new(
        Arc::new(MockTileSource::new("mock")),
        DownloaderConfig::new(dir.path()),
    );
    let request = DownloadRequest::new(test_bbox(), 12, OutputMode::Raster).with_preview(true);
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    let preview = report.preview_path.unwrap();
    assert!(preview.exists());
    let raster = read_raster(report.raster_path.as_ref().unwrap());
    let preview = read_raster(&preview);
    assert_eq!(raster.dimensions(), preview.dimensions());
}

// =============================================================================
// Partial Failure
// =============================================================================

#[tokio::test]
async fn test_failed_tile_leaves_transparent_gap() {
    let dir = tempfile::tempdir().unwrap();
    let probe = MockTileSource::new("mock");
    let bounds = grid_of(&probe, ZOOM);
    let (gap_col, gap_row) = (bounds.min_col, bounds.max_row);

    let source = MockTileSource::new("mock").failing_when(move |t| t.x() == gap_col && t.y() == gap_row);
    let downloader = BoundedDownloader::new(Arc::new(source), DownloaderConfig::new(dir.path()));
    let request = DownloadRequest::new(test_bbox(), ZOOM, OutputMode::Raster);
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.succeeded, report.total - 1);
    assert!(report.is_partial());

    let raster = read_raster(report.raster_path.as_ref().unwrap());
    assert_eq!(raster.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
    assert_eq!(
        raster.get_pixel(raster.width() - 1, raster.height() - 1),
        &color_for(bounds.max_col, bounds.min_row)
    );
}

#[tokio::test]
async fn test_too_many_failures_writes_no_raster() {
    let dir = tempfile::tempdir().unwrap();
    let probe = MockTileSource::new("mock");
    let bounds = grid_of(&probe, ZOOM);
    let keep = (bounds.min_col, bounds.min_row);

    // Only one tile succeeds
    let source = MockTileSource::new("mock").failing_when(move |t| (t.x(), t.y()) != keep);
    let downloader = BoundedDownloader::new(Arc::new(source), DownloaderConfig::new(dir.path()));
    let request = DownloadRequest::new(test_bbox(), ZOOM, OutputMode::Raster);
    let result = downloader.download(&request, CancellationToken::new()).await;

    match result {
        Err(DownloadError::InsufficientSuccess {
            succeeded,
            total,
            last_error,
            ..
        }) => {
            assert_eq!(succeeded, 1);
            assert_eq!(total, (bounds.cols() * bounds.rows()) as usize);
            assert!(last_error.unwrap().contains("503"));
        }
        Err(e) => panic!("expected InsufficientSuccess, got {}", e),
        Ok(_) => panic!("expected InsufficientSuccess, got a report"),
    }

    assert!(!dir.path().join(request.raster_file_name("mock")).exists());
}

// =============================================================================
// Historical Fallback
// =============================================================================

#[tokio::test]
async fn test_dated_tiles_fall_back_one_level() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MockTileSource::new("mock").serving_up_to(ZOOM - 1));
    let bounds = grid_of(&source, ZOOM);

    let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(dir.path()));
    let request = DownloadRequest::new(test_bbox(), ZOOM, OutputMode::Both).with_date("2020-01-15");
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, report.total);
    assert_eq!(report.fallbacks, report.total);

    // Each request tries the exact zoom before its parent
    let requests = source.requests();
    assert!(requests.iter().any(|k| k.starts_with(&format!("mock:{}:", ZOOM))));
    assert!(requests.iter().any(|k| k.starts_with(&format!("mock:{}:", ZOOM - 1))));

    // Parent tiles are filed under their own zoom level
    assert!(dir.path().join(format!("mock/{}", ZOOM - 1)).is_dir());
    assert!(!dir.path().join(format!("mock/{}", ZOOM)).exists());

    // Crops of a solid parent keep the parent's color
    let raster = read_raster(report.raster_path.as_ref().unwrap());
    assert_eq!(
        raster.get_pixel(0, 0),
        &color_for(bounds.min_col >> 1, bounds.max_row >> 1)
    );
}

#[tokio::test]
async fn test_current_imagery_does_not_fall_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MockTileSource::new("mock").serving_up_to(ZOOM - 1));
    let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(dir.path()));

    let request = DownloadRequest::new(test_bbox(), ZOOM, OutputMode::Tiles);
    let result = downloader.download(&request, CancellationToken::new()).await;

    assert!(matches!(
        result,
        Err(DownloadError::InsufficientSuccess { succeeded: 0, .. })
    ));
    assert!(source
        .requests()
        .iter()
        .all(|k| k.starts_with(&format!("mock:{}:", ZOOM))));
}

// =============================================================================
// Tile Files
// =============================================================================

#[tokio::test]
async fn test_both_mode_writes_tiles_and_raster() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = BoundedDownloader::new(
        Arc::new(MockTileSource::new("mock")),
        DownloaderConfig::new(dir.path()),
    );
    let request = DownloadRequest::new(test_bbox(), 13, OutputMode::Both);
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.raster_path.as_ref().unwrap().exists());
    let tiles_dir = report.tiles_dir.unwrap().join("mock").join("13");
    assert_eq!(count_files(&tiles_dir), report.total);
}

#[tokio::test]
async fn test_tiles_mode_skips_raster() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = BoundedDownloader::new(
        Arc::new(MockTileSource::new("mock")),
        DownloaderConfig::new(dir.path()),
    );
    let request = DownloadRequest::new(test_bbox(), 13, OutputMode::Tiles);
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.raster_path.is_none());
    assert!(report.geotransform.is_none());
    assert_eq!(count_files(dir.path()), report.total);
}

#[tokio::test]
async fn test_already_cancelled_download_fetches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MockTileSource::new("mock"));
    let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(dir.path()));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = DownloadRequest::new(test_bbox(), 13, OutputMode::Raster);
    let result = downloader.download(&request, cancel).await;

    assert!(matches!(result, Err(DownloadError::Cancelled)));
    assert_eq!(source.fetch_count(), 0);
}
