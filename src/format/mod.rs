//! Output formats for assembled rasters.
//!
//! Only one container is produced: a single-strip, uncompressed RGBA classic
//! TIFF with GeoTIFF tags, written byte by byte by [`tiff::GeoTiffEncoder`].
//! The module also carries a small directory reader used to verify and
//! inspect written files.

pub mod tiff;

pub use tiff::{read_directory, write_preview, GeoTiffEncoder, TagValue, TiffField, TiffTag};
