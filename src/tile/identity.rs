//! Tile identity and its on-disk naming.
//!
//! A tile is named by `(provider, z, x, y, date)`. Two identities that differ
//! only in how the provider or date were spelled map to the same key and the
//! same file, so construction normalizes both:
//!
//! - the provider is trimmed and lower-cased
//! - the date is trimmed and its path-unsafe characters replaced with `-`
//! - an empty date is the same as no date
//!
//! Rows (`y`) follow the TMS convention used throughout the crate: row 0 is
//! the southernmost row and rows increase northwards.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Extension used when the payload format is not recognised.
pub const DEFAULT_EXTENSION: &str = "jpg";

/// Characters that may not appear in a file name on common filesystems.
const UNSAFE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

// =============================================================================
// TileIdentity
// =============================================================================

/// Uniquely names one tile of one provider, optionally for a historical date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileIdentity {
    provider: String,
    z: u8,
    x: u32,
    y: u32,
    date: Option<String>,
}

impl TileIdentity {
    /// Identity of the current (undated) imagery for a tile.
    pub fn new(provider: &str, z: u8, x: u32, y: u32) -> Self {
        Self {
            provider: normalize_provider(provider),
            z,
            x,
            y,
            date: None,
        }
    }

    /// Attach a historical date. Empty or whitespace-only dates clear it.
    pub fn with_date(mut self, date: impl AsRef<str>) -> Self {
        self.date = normalize_date(date.as_ref());
        self
    }

    /// Attach an optional historical date.
    pub fn with_optional_date(self, date: Option<&str>) -> Self {
        match date {
            Some(d) => self.with_date(d),
            None => self,
        }
    }

    /// Normalized provider name.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Zoom level.
    pub fn z(&self) -> u8 {
        self.z
    }

    /// Column.
    pub fn x(&self) -> u32 {
        self.x
    }

    /// TMS row.
    pub fn y(&self) -> u32 {
        self.y
    }

    /// Sanitized historical date, if any.
    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    /// Cache key: `provider:z:x:y[:date]`.
    pub fn key(&self) -> String {
        match self.date {
            Some(ref date) => format!("{}:{}:{}:{}:{}", self.provider, self.z, self.x, self.y, date),
            None => format!("{}:{}:{}:{}", self.provider, self.z, self.x, self.y),
        }
    }

    /// File name stem: `y` or `y_date`.
    pub fn file_stem(&self) -> String {
        match self.date {
            Some(ref date) => format!("{}_{}", self.y, date),
            None => self.y.to_string(),
        }
    }

    /// Path relative to a storage root: `provider/z/x/y[_date].ext`.
    pub fn relative_path(&self, ext: &str) -> PathBuf {
        let mut path = PathBuf::from(&self.provider);
        path.push(self.z.to_string());
        path.push(self.x.to_string());
        path.push(format!("{}.{}", self.file_stem(), ext));
        path
    }

    /// The tile `levels` zoom levels up that contains this one.
    ///
    /// Returns `None` when that would go above zoom 0.
    pub fn ancestor(&self, levels: u8) -> Option<Self> {
        if levels > self.z {
            return None;
        }
        Some(Self {
            provider: self.provider.clone(),
            z: self.z - levels,
            x: self.x.checked_shr(levels as u32).unwrap_or(0),
            y: self.y.checked_shr(levels as u32).unwrap_or(0),
            date: self.date.clone(),
        })
    }

    /// Reconstruct an identity from the components of a stored path.
    ///
    /// `file_name` is `y[_date].ext`. Returns `None` for names that were not
    /// produced by [`relative_path`](Self::relative_path).
    pub fn from_path_parts(provider: &str, z: &str, x: &str, file_name: &str) -> Option<Self> {
        let z: u8 = z.parse().ok()?;
        let x: u32 = x.parse().ok()?;

        let (stem, ext) = file_name.rsplit_once('.')?;
        if ext.is_empty() || provider.is_empty() {
            return None;
        }

        let (y, date) = match stem.split_once('_') {
            Some((y, date)) => (y, Some(date)),
            None => (stem, None),
        };
        let y: u32 = y.parse().ok()?;

        Some(Self::new(provider, z, x, y).with_optional_date(date))
    }
}

impl fmt::Display for TileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// =============================================================================
// Normalization
// =============================================================================

fn normalize_provider(provider: &str) -> String {
    provider.trim().to_lowercase()
}

fn normalize_date(date: &str) -> Option<String> {
    let trimmed = date.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(sanitize_date(trimmed))
    }
}

/// Replace path-unsafe characters and whitespace with `-`.
///
/// `"2020/01/15"` becomes `"2020-01-15"`.
pub fn sanitize_date(date: &str) -> String {
    date.chars()
        .map(|c| {
            if UNSAFE_CHARS.contains(&c) || c.is_whitespace() {
                '-'
            } else {
                c
            }
        })
        .collect()
}

/// File extension for an image payload, detected from its magic bytes.
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        "png"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "webp"
    } else {
        DEFAULT_EXTENSION
    }
}

// =============================================================================
// Tests
// =============================================================================
