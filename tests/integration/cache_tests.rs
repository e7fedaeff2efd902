//! Disk cache integration tests.
//!
//! Tests verify:
//! - A second download of the same area is served from the cache
//! - Cached tiles and the index survive a restart
//! - The cache stays within its size bound across downloads
//! - Fallback tiles are cached under the tile that actually served them
//! - Concurrent writers of one tile leave its record matching the file

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use tile_mosaic::cache::{index_path, CacheConfig, PersistentTileCache};
use tile_mosaic::download::{BoundedDownloader, DownloadRequest, DownloaderConfig, OutputMode};
use tile_mosaic::{TileIdentity, TileSource};

use super::test_utils::{read_raster, test_bbox, MockTileSource};

async fn open_cache(dir: &std::path::Path) -> Arc<PersistentTileCache> {
    PersistentTileCache::open(CacheConfig::new(dir)).await.unwrap()
}

// =============================================================================
// Cache-Through Downloads
// =============================================================================

#[tokio::test]
async fn test_second_download_served_from_cache() {
    let cache_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let cache = open_cache(cache_dir.path()).await;
    let source = Arc::new(MockTileSource::new("mock"));

    let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(out_dir.path()))
        .with_cache(cache.clone());
    let request = DownloadRequest::new(test_bbox(), 13, OutputMode::Raster);

    let first = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.cache_hits, 0);
    assert_eq!(source.fetch_count(), first.total);
    assert_eq!(cache.stats().entry_count, first.total as u64);

    let second = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.cache_hits, second.total);
    assert_eq!(source.fetch_count(), first.total, "no new fetches expected");

    cache.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dates_are_cached_separately() {
    let cache_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let cache = open_cache(cache_dir.path()).await;
    let source = Arc::new(MockTileSource::new("mock"));

    let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(out_dir.path()))
        .with_cache(cache.clone());

    let current = DownloadRequest::new(test_bbox(), 12, OutputMode::Tiles);
    let dated = current.clone().with_date("2018-03-01");

    let a = downloader.download(&current, CancellationToken::new()).await.unwrap();
    let b = downloader.download(&dated, CancellationToken::new()).await.unwrap();

    assert_eq!(b.cache_hits, 0);
    assert_eq!(cache.stats().entry_count, (a.total + b.total) as u64);

    cache.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fallback_tiles_cached_under_parent() {
    let cache_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let cache = open_cache(cache_dir.path()).await;
    let source = Arc::new(MockTileSource::new("mock").serving_up_to(12));

    let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(out_dir.path()))
        .with_cache(cache.clone());
    let request = DownloadRequest::new(test_bbox(), 13, OutputMode::Raster).with_date("2020-01-15");
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.fallbacks, report.total);

    let tiles = source.tile_grid(&test_bbox(), 13).unwrap();
    let first = tiles[0];
    let child = TileIdentity::new("mock", 13, first.col, first.row).with_date("2020-01-15");
    let parent = child.ancestor(1).unwrap();

    assert!(cache.get(&child).await.is_none());
    assert!(cache.get(&parent).await.is_some());

    cache.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_dated_download_served_from_cached_parents() {
    let cache_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let cache = open_cache(cache_dir.path()).await;
    let source = Arc::new(MockTileSource::new("mock").serving_up_to(12));

    let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(out_dir.path()))
        .with_cache(cache.clone());
    let request = DownloadRequest::new(test_bbox(), 13, OutputMode::Raster).with_date("2020-01-15");

    let first = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();
    let fetches = source.fetch_count();
    assert!(fetches > 0);
    let first_raster = read_raster(first.raster_path.as_ref().unwrap());

    let second = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(source.fetch_count(), fetches, "no new provider requests expected");
    assert_eq!(second.cache_hits, second.total);
    assert_eq!(second.fallbacks, second.total);

    // Both runs crop the same parents into identical rasters
    let second_raster = read_raster(second.raster_path.as_ref().unwrap());
    assert_eq!(first_raster.as_raw(), second_raster.as_raw());

    cache.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_keep_size_consistent() {
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = open_cache(cache_dir.path()).await;
    let identity = TileIdentity::new("mock", 12, 1205, 2540).with_date("2019-06-01");
    let payloads = [vec![b'a'; 100_000], vec![b'b'; 200_000]];

    for _ in 0..20 {
        let mut writers = Vec::new();
        for payload in payloads.iter().cycle().take(4) {
            let cache = Arc::clone(&cache);
            let identity = identity.clone();
            let data = Bytes::from(payload.clone());
            writers.push(tokio::spawn(async move { cache.set(&identity, data).await }));
        }
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let cached = cache.get(&identity).await.unwrap();
        assert!(payloads.iter().any(|p| p.as_slice() == cached.as_ref()));
        assert_eq!(cache.stats().size_bytes, cached.len() as u64);
        assert_eq!(cache.stats().entry_count, 1);
    }

    cache.shutdown().await.unwrap();
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_cache_survives_restart() {
    let cache_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let request = DownloadRequest::new(test_bbox(), 13, OutputMode::Tiles);

    let total = {
        let cache = open_cache(cache_dir.path()).await;
        let downloader = BoundedDownloader::new(
            Arc::new(MockTileSource::new("mock")),
            DownloaderConfig::new(out_dir.path()),
        )
        .with_cache(cache.clone());
        let report = downloader
            .download(&request, CancellationToken::new())
            .await
            .unwrap();
        cache.shutdown().await.unwrap();
        report.total
    };

    assert!(index_path(cache_dir.path()).exists());

    let cache = open_cache(cache_dir.path()).await;
    assert_eq!(cache.stats().entry_count, total as u64);

    let source = Arc::new(MockTileSource::new("mock"));
    let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(out_dir.path()))
        .with_cache(cache.clone());
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.cache_hits, total);
    assert_eq!(source.fetch_count(), 0);

    cache.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lost_index_rebuilt_from_files() {
    let cache_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let request = DownloadRequest::new(test_bbox(), 13, OutputMode::Tiles);

    let cache = open_cache(cache_dir.path()).await;
    let downloader = BoundedDownloader::new(
        Arc::new(MockTileSource::new("mock")),
        DownloaderConfig::new(out_dir.path()),
    )
    .with_cache(cache.clone());
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();
    cache.shutdown().await.unwrap();
    drop(cache);

    std::fs::remove_file(index_path(cache_dir.path())).unwrap();

    let cache = open_cache(cache_dir.path()).await;
    assert_eq!(cache.stats().entry_count, report.total as u64);
    assert!(index_path(cache_dir.path()).exists());

    cache.shutdown().await.unwrap();
}

// =============================================================================
// Size Bound
// =============================================================================

#[tokio::test]
async fn test_cache_stays_within_size_bound() {
    let cache_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();

    // Room for a handful of small PNG tiles
    let max_bytes = 400;
    let config = CacheConfig::new(cache_dir.path())
        .with_max_size_bytes(max_bytes)
        .with_sweep_interval(Duration::from_millis(20));
    let cache = PersistentTileCache::open(config).await.unwrap();

    let downloader = BoundedDownloader::new(
        Arc::new(MockTileSource::new("mock")),
        DownloaderConfig::new(out_dir.path()),
    )
    .with_cache(cache.clone());
    let request = DownloadRequest::new(test_bbox(), 14, OutputMode::Tiles);
    let report = downloader
        .download(&request, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.succeeded, report.total);

    cache.run_eviction().await;
    let stats = cache.stats();
    assert!(stats.size_bytes <= max_bytes);
    assert!((stats.entry_count as usize) < report.total);

    cache.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clear_then_download_refetches() {
    let cache_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let cache = open_cache(cache_dir.path()).await;
    let source = Arc::new(MockTileSource::new("mock"));

    let downloader = BoundedDownloader::new(source.clone(), DownloaderConfig::new(out_dir.path()))
        .with_cache(cache.clone());
    let request = DownloadRequest::new(test_bbox(), 12, OutputMode::Tiles);

    let first = downloader.download(&request, CancellationToken::new()).await.unwrap();
    cache.clear().await.unwrap();
    assert_eq!(cache.stats().entry_count, 0);

    let second = downloader.download(&request, CancellationToken::new()).await.unwrap();
    assert_eq!(second.cache_hits, 0);
    assert_eq!(source.fetch_count(), first.total * 2);

    cache.shutdown().await.unwrap();
}
