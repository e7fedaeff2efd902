//! tile-mosaic - Fetch imagery tiles and assemble georeferenced rasters.
//!
//! This binary parses the command line and runs one subcommand.

use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tile_mosaic::{
    config::{CacheCommand, CacheDirArgs, CacheStatsConfig, Cli, Command, DownloadConfig, InspectConfig},
    read_directory, BoundedDownloader, DownloadCallbacks, DownloadError, DownloadRequest,
    HttpTileSource, PersistentTileCache,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Download(config) => run_download(config).await,
        Command::Cache(CacheCommand::Stats(config)) => run_cache_stats(config).await,
        Command::Cache(CacheCommand::Clear(config)) => run_cache_clear(config).await,
        Command::Inspect(config) => run_inspect(config),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tile_mosaic=debug"
    } else {
        "tile_mosaic=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Download Command
// =============================================================================

async fn run_download(config: DownloadConfig) -> ExitCode {
    init_logging(config.cache.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let bbox = match config.bounding_box() {
        Ok(bbox) => bbox,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let source = match HttpTileSource::with_timeout(
        &config.provider,
        &config.template,
        config.max_zoom,
        config.fetch_timeout(),
    ) {
        Ok(source) => source,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    info!("  Provider: {} (max zoom {})", config.provider, config.max_zoom);
    info!("  Bounding box: {:?}", config.bbox);
    info!("  Zoom: {}, mode: {}", config.zoom, config.mode);
    info!("  Output: {}", config.output_dir.display());

    let cache = if config.no_cache {
        warn!("  Cache: DISABLED - every tile is fetched from the provider");
        None
    } else {
        match PersistentTileCache::open(config.cache.cache_config()).await {
            Ok(cache) => {
                let stats = cache.stats();
                info!(
                    "  Cache: {} ({} entries, {} MB)",
                    config.cache.cache_dir.display(),
                    stats.entry_count,
                    stats.size_bytes / (1024 * 1024)
                );
                Some(cache)
            }
            Err(e) => {
                error!("Failed to open cache: {}", e);
                return ExitCode::FAILURE;
            }
        }
    };

    let callbacks = DownloadCallbacks::new().on_progress(|p| {
        info!(
            "[{:>5.1}%] {}/{} {}",
            p.percent, p.downloaded, p.total, p.status
        );
    });

    let mut downloader = BoundedDownloader::new(Arc::new(source), config.downloader_config())
        .with_callbacks(callbacks);
    if let Some(ref cache) = cache {
        downloader = downloader.with_cache(Arc::clone(cache));
    }

    let mut request = DownloadRequest::new(bbox, config.zoom, config.mode)
        .with_preview(config.preview);
    if let Some(ref date) = config.date {
        request = request.with_date(date.as_str());
    }
    if let Some(ref alternate) = config.alternate_date {
        request = request.with_alternate_date(alternate.as_str());
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling download");
            ctrl_c.cancel();
        }
    });

    let result = downloader.download(&request, cancel).await;

    if let Some(cache) = cache {
        if let Err(e) = cache.shutdown().await {
            warn!("Failed to persist cache index: {}", e);
        }
    }

    match result {
        Ok(report) => {
            if config.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        error!("Failed to serialize report: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                info!("");
                info!(
                    "Downloaded {} of {} tiles ({} from cache)",
                    report.succeeded, report.total, report.cache_hits
                );
                if let Some(ref path) = report.raster_path {
                    info!("  Raster: {}", path.display());
                }
                if let Some(ref path) = report.preview_path {
                    info!("  Preview: {}", path.display());
                }
                if let Some(ref dir) = report.tiles_dir {
                    info!("  Tiles: {}", dir.display());
                }
            }
            ExitCode::SUCCESS
        }
        Err(DownloadError::Cancelled) => {
            warn!("Download cancelled");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Download failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Cache Commands
// =============================================================================

async fn open_cache(args: &CacheDirArgs) -> Option<Arc<PersistentTileCache>> {
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        return None;
    }
    match PersistentTileCache::open(args.cache_config()).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            eprintln!("Error: failed to open cache: {}", e);
            None
        }
    }
}

async fn run_cache_stats(config: CacheStatsConfig) -> ExitCode {
    if config.cache.verbose {
        init_logging(true);
    }

    let Some(cache) = open_cache(&config.cache).await else {
        return ExitCode::FAILURE;
    };
    let stats = cache.stats();

    if config.json {
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        let used = stats.size_bytes as f64 / (1024.0 * 1024.0);
        let max = stats.max_size_bytes as f64 / (1024.0 * 1024.0);
        println!("Cache: {}", config.cache.cache_dir.display());
        println!("  Entries: {}", stats.entry_count);
        println!("  Size: {:.2} MB of {:.2} MB", used, max);
    }

    if let Err(e) = cache.shutdown().await {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run_cache_clear(config: CacheDirArgs) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    let Some(cache) = open_cache(&config).await else {
        return ExitCode::FAILURE;
    };
    let before = cache.stats();

    if let Err(e) = cache.clear().await {
        eprintln!("Error: failed to clear cache: {}", e);
        return ExitCode::FAILURE;
    }
    if let Err(e) = cache.shutdown().await {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    println!(
        "Removed {} entries ({:.2} MB) from {}",
        before.entry_count,
        before.size_bytes as f64 / (1024.0 * 1024.0),
        config.cache_dir.display()
    );
    ExitCode::SUCCESS
}

// =============================================================================
// Inspect Command
// =============================================================================

fn run_inspect(config: InspectConfig) -> ExitCode {
    match inspect(&config.file, config.json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn inspect(path: &Path, json: bool) -> Result<(), String> {
    let bytes = std::fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let ifd = read_directory(&bytes).map_err(|e| e.to_string())?;

    if json {
        let text = serde_json::to_string_pretty(&ifd).map_err(|e| e.to_string())?;
        println!("{}", text);
        return Ok(());
    }

    println!("{}", path.display());
    println!("═════════════════════════════════");
    println!(
        "Byte order: {:?}, first IFD at {}",
        ifd.header.byte_order, ifd.header.first_ifd_offset
    );
    println!("Entries: {}", ifd.entries.len());
    println!();
    for entry in &ifd.entries {
        let value = match entry.value {
            Some(ref value) => summarize(value),
            None => "(unsupported type)".to_string(),
        };
        println!(
            "  {:>5}  {:<24} type {:>2} x{:<6} {}",
            entry.tag, entry.tag_name(), entry.field_type, entry.count, value
        );
    }
    Ok(())
}

/// First few values of a tag, compactly.
fn summarize(value: &tile_mosaic::TagValue) -> String {
    const SHOWN: usize = 8;
    let json = serde_json::to_value(value).unwrap_or_default();
    match json.get("values") {
        Some(serde_json::Value::Array(items)) => {
            let head: Vec<String> = items.iter().take(SHOWN).map(|v| v.to_string()).collect();
            if items.len() > SHOWN {
                format!("[{}, ... {} more]", head.join(", "), items.len() - SHOWN)
            } else {
                format!("[{}]", head.join(", "))
            }
        }
        Some(other) => other.to_string(),
        None => json.to_string(),
    }
}
