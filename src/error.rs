use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while validating a download request, before any I/O happens.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Bounding box is malformed or outside the projectable range
    #[error("Invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    /// Zoom level exceeds what the provider serves
    #[error("Invalid zoom level {zoom}: provider supports 0..={max}")]
    InvalidZoom { zoom: u8, max: u8 },

    /// Output mode string not recognised
    #[error("Invalid output mode '{0}': expected one of tiles, raster, both")]
    InvalidOutputMode(String),

    /// Tile URL template lacks a required placeholder
    #[error("Invalid URL template '{template}': missing {placeholder}")]
    InvalidTemplate { template: String, placeholder: &'static str },

    /// Zoom level is deeper than the crate's grid arithmetic supports
    #[error("Unsupported zoom level {zoom}: at most {max} is supported")]
    UnsupportedZoom { zoom: u8, max: u8 },

    /// Request covers more tiles than the configured limit
    #[error("Too many tiles: {count} exceeds limit of {limit}")]
    TooManyTiles { count: u64, limit: u64 },

    /// HTTP client could not be built (TLS backend failed to load)
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// Requested raster would exceed the configured pixel budget
    #[error("Raster too large: {width}x{height} pixels exceeds limit of {limit} pixels")]
    CanvasTooLarge { width: u64, height: u64, limit: u64 },
}

/// Errors from a single tile fetch.
///
/// These are recorded per tile by the downloader and never abort a batch on
/// their own.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Provider answered with a non-success HTTP status
    #[error("HTTP {status} fetching {url}")]
    Http { status: u16, url: String },

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Provider has no imagery for this tile
    #[error("Tile not found: {0}")]
    NotFound(String),

    /// Provider returned an empty body
    #[error("Empty response for tile {0}")]
    EmptyResponse(String),

    /// Tile coordinates could not be resolved for the request
    #[error("Tile grid error: {0}")]
    Grid(String),

    /// Fetch exceeded the configured timeout
    #[error("Fetch timed out after {0} ms")]
    Timeout(u64),

    /// Download was cancelled while the fetch was in flight
    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether the provider answered but has no imagery for the tile.
    pub fn is_unavailable(&self) -> bool {
        match self {
            FetchError::NotFound(_) | FetchError::EmptyResponse(_) => true,
            FetchError::Http { status, .. } => *status == 404 || *status == 204,
            _ => false,
        }
    }
}

/// Errors from the persistent tile cache.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Filesystem operation failed
    #[error("Cache I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Metadata index could not be serialized
    #[error("Cache index error: {0}")]
    Index(String),

    /// Blocking task could not be joined
    #[error("Cache task failed: {0}")]
    Task(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Errors that can occur when parsing TIFF files
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42, got {0}")]
    InvalidVersion(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Entry value points outside the file
    #[error("Value for tag {tag} at offset {offset} ({len} bytes) is outside the file")]
    ValueOutOfBounds { tag: u16, offset: u64, len: u64 },

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),
}

/// Errors from writing a raster file.
#[derive(Debug, Clone, Error)]
pub enum EncodeError {
    /// Disk write or rename failed
    #[error("I/O error writing {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Canvas dimensions are unusable
    #[error("Invalid canvas: {0}")]
    InvalidCanvas(String),

    /// Two directory entries share one tag
    #[error("Duplicate tag {0} in directory")]
    DuplicateTag(u16),

    /// Tag carries no values
    #[error("Tag {0} has no values")]
    EmptyValue(u16),

    /// Output would not fit the 32-bit offsets of a classic TIFF
    #[error("Raster of {0} bytes exceeds the 4 GiB classic TIFF limit")]
    TooLarge(u64),

    /// Preview encoding through the image codec failed
    #[error("Preview encoding failed: {0}")]
    Preview(String),
}

impl EncodeError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        EncodeError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Errors from decoding a fetched tile image.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// Tile bytes are not a decodable image
    #[error("Failed to decode tile: {message}")]
    DecodeError { message: String },

    /// Writing a tile file failed
    #[error("Failed to write tile {path}: {message}")]
    Write { path: PathBuf, message: String },
}

/// Errors returned by a whole download operation.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Request rejected before any I/O
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Tile grid could not be resolved
    #[error("Failed to resolve tile grid: {0}")]
    Grid(#[from] FetchError),

    /// Provider yielded no tiles for the bounding box
    #[error("No tiles cover the requested area")]
    EmptyTileSet,

    /// Too many tiles failed for the result to be useful
    #[error(
        "Only {succeeded} of {total} tiles downloaded ({:.0}% < required {:.0}%)",
        percent(.succeeded, .total),
        .required_rate * 100.0
    )]
    InsufficientSuccess {
        succeeded: usize,
        total: usize,
        required_rate: f64,
        last_error: Option<String>,
    },

    /// Writing the raster failed
    #[error("Raster encoding failed: {0}")]
    Encode(#[from] EncodeError),

    /// Output directory could not be prepared
    #[error("I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Background task panicked or was aborted
    #[error("Download task failed: {0}")]
    Task(String),

    /// Caller cancelled the download
    #[error("Download cancelled")]
    Cancelled,
}

fn percent(part: &usize, whole: &usize) -> f64 {
    if *whole == 0 {
        0.0
    } else {
        *part as f64 * 100.0 / *whole as f64
    }
}
