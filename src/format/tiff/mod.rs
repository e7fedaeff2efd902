//! Classic TIFF writing and reading for georeferenced mosaics.
//!
//! # Key Concepts
//!
//! - **Byte order**: rasters are always written little-endian (`II`). The
//!   reader accepts both orders so it can inspect files from other tools.
//!
//! - **Directory**: a single IFD of 12-byte entries in ascending tag order,
//!   placed immediately after the 8-byte header.
//!
//! - **Inline vs out-of-line values**: payloads of at most 4 bytes live in the
//!   entry itself; larger payloads go to a value area after the directory and
//!   the entry holds their absolute offset.
//!
//! - **GeoTIFF**: ModelPixelScale and ModelTiepoint carry the affine placement,
//!   the GeoKey directory names the coordinate reference system.

mod geokeys;
mod parser;
mod tags;
mod values;
mod writer;

pub use geokeys::{geokeys_for_epsg, web_mercator_geokeys, EPSG_WEB_MERCATOR, EPSG_WGS84};
pub use parser::{read_directory, ByteOrder, Ifd, IfdEntry, TiffHeader, TIFF_HEADER_SIZE};
pub use tags::{FieldType, TiffTag};
pub use values::TagValue;
pub use writer::{write_preview, GeoTiffEncoder, TiffField, BITS_PER_SAMPLE, SAMPLES_PER_PIXEL};
