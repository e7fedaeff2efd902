//! Download requests and output naming.

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::Serialize;

use crate::error::ValidationError;
use crate::format::tiff::TiffField;
use crate::tile::{sanitize_date, BoundingBox, MAX_SUPPORTED_ZOOM};

/// What a download produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Individual tile files only
    Tiles,
    /// One georeferenced raster only
    Raster,
    /// Tile files and a raster
    Both,
}

impl OutputMode {
    pub fn wants_tiles(self) -> bool {
        matches!(self, OutputMode::Tiles | OutputMode::Both)
    }

    pub fn wants_raster(self) -> bool {
        matches!(self, OutputMode::Raster | OutputMode::Both)
    }
}

impl FromStr for OutputMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiles" => Ok(OutputMode::Tiles),
            "raster" | "geotiff" => Ok(OutputMode::Raster),
            "both" => Ok(OutputMode::Both),
            _ => Err(ValidationError::InvalidOutputMode(s.to_string())),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputMode::Tiles => "tiles",
            OutputMode::Raster => "raster",
            OutputMode::Both => "both",
        })
    }
}

/// One download: an area, a zoom level and what to produce.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub bbox: BoundingBox,
    pub zoom: u8,
    pub mode: OutputMode,

    /// Historical imagery date; `None` for current imagery
    pub date: Option<String>,

    /// Second encoding of `date` tried by providers that need it
    pub alternate_date: Option<String>,

    /// Also write a plain TIFF preview next to the raster
    pub preview: bool,

    /// Additional tags for the raster, e.g. GeoKeys
    pub extra_tags: Vec<TiffField>,
}

impl DownloadRequest {
    pub fn new(bbox: BoundingBox, zoom: u8, mode: OutputMode) -> Self {
        Self {
            bbox,
            zoom,
            mode,
            date: None,
            alternate_date: None,
            preview: false,
            extra_tags: Vec::new(),
        }
    }

    /// Empty dates are treated as no date.
    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        let date = date.into();
        self.date = if date.trim().is_empty() {
            None
        } else {
            Some(date.trim().to_string())
        };
        self
    }

    pub fn with_alternate_date(mut self, date: impl Into<String>) -> Self {
        self.alternate_date = Some(date.into());
        self
    }

    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_extra_tags(mut self, tags: Vec<TiffField>) -> Self {
        self.extra_tags = tags;
        self
    }

    /// Check the request against a provider's zoom limit.
    pub fn validate(&self, max_zoom: u8) -> Result<(), ValidationError> {
        self.bbox.validate()?;
        if self.zoom > MAX_SUPPORTED_ZOOM {
            return Err(ValidationError::UnsupportedZoom {
                zoom: self.zoom,
                max: MAX_SUPPORTED_ZOOM,
            });
        }
        if self.zoom > max_zoom {
            return Err(ValidationError::InvalidZoom {
                zoom: self.zoom,
                max: max_zoom,
            });
        }
        Ok(())
    }

    /// Deterministic raster file name for this request.
    ///
    /// `{provider}_{date|latest}_z{zoom}_{south}_{west}_{north}_{east}.tif`
    /// with coordinates at six decimals.
    pub fn raster_file_name(&self, provider: &str) -> String {
        format!("{}.tif", self.file_stem(provider))
    }

    /// File name of the optional preview raster.
    pub fn preview_file_name(&self, provider: &str) -> String {
        format!("{}_preview.tif", self.file_stem(provider))
    }

    fn file_stem(&self, provider: &str) -> String {
        let date = self.date.as_deref().unwrap_or("latest");
        let stem = format!(
            "{}_{}_z{}_{:.6}_{:.6}_{:.6}_{:.6}",
            provider.trim().to_lowercase(),
            date,
            self.zoom,
            self.bbox.south,
            self.bbox.west,
            self.bbox.north,
            self.bbox.east
        );
        sanitize_date(&stem)
    }
}
