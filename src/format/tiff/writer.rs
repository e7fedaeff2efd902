//! Georeferenced raster writer.
//!
//! Produces a single-image, single-strip, uncompressed RGBA classic TIFF with
//! GeoTIFF tags. The file is laid out in four consecutive sections:
//!
//! ```text
//! ┌──────────────────────────┐ 0
//! │ Header (8 bytes)         │   "II", 42, offset of the directory (8)
//! ├──────────────────────────┤ 8
//! │ Directory                │   entry count, 12-byte entries, next = 0
//! ├──────────────────────────┤ 8 + directory size
//! │ Out-of-line value area   │   payloads larger than 4 bytes, word aligned
//! ├──────────────────────────┤ end of value area (word aligned)
//! │ Pixel strip              │   width * height * 4 bytes, row-major RGBA
//! └──────────────────────────┘
//! ```
//!
//! Entries are written in ascending tag order. The strip offset depends on
//! the size of the value area, so StripOffsets and StripByteCounts are filled
//! in after every other entry has been placed.

use std::io::{Cursor, Write};
use std::path::Path;

use image::RgbaImage;
use tracing::debug;

use crate::error::EncodeError;
use crate::io::{write_atomic_blocking, AtomicFile};
use crate::raster::GeoTransform;

use super::parser::{IFD_COUNT_SIZE, IFD_ENTRY_SIZE, IFD_NEXT_OFFSET_SIZE, TIFF_HEADER_SIZE, VERSION_TIFF};
use super::tags::{
    FieldType, TiffTag, COMPRESSION_NONE, EXTRA_SAMPLE_UNASSOCIATED_ALPHA, PHOTOMETRIC_RGB,
    PLANAR_CHUNKY, RESOLUTION_UNIT_NONE,
};
use super::values::TagValue;

/// Samples per pixel of every raster this crate writes.
pub const SAMPLES_PER_PIXEL: u16 = 4;

/// Bits per sample of every raster this crate writes.
pub const BITS_PER_SAMPLE: u16 = 8;

// =============================================================================
// TiffField
// =============================================================================

/// A tag and its value, as supplied to the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct TiffField {
    /// Tag ID
    pub tag: u16,

    /// Payload
    pub value: TagValue,
}

impl TiffField {
    /// Create a field from a raw tag ID.
    pub fn new(tag: u16, value: TagValue) -> Self {
        Self { tag, value }
    }

    /// Create a field from a known tag.
    pub fn known(tag: TiffTag, value: TagValue) -> Self {
        Self::new(tag.as_u16(), value)
    }
}

// =============================================================================
// Layout
// =============================================================================

/// A directory entry with its value field resolved.
#[derive(Debug, Clone, Copy)]
struct PlacedEntry {
    tag: u16,
    field_type: FieldType,
    count: u32,
    value_field: [u8; 4],
}

/// Fully resolved byte layout of a raster file, minus the pixels.
#[derive(Debug)]
struct FileLayout {
    entries: Vec<PlacedEntry>,
    value_area: Vec<u8>,
    pixel_offset: u32,
    pixel_len: u32,
}

impl FileLayout {
    /// Place sorted fields and compute every offset.
    fn build(mut fields: Vec<TiffField>, pixel_len: u64) -> Result<Self, EncodeError> {
        for field in &fields {
            if field.value.is_empty() {
                return Err(EncodeError::EmptyValue(field.tag));
            }
        }

        fields.sort_by_key(|f| f.tag);
        if let Some(pair) = fields.windows(2).find(|w| w[0].tag == w[1].tag) {
            return Err(EncodeError::DuplicateTag(pair[0].tag));
        }

        let directory_size =
            IFD_COUNT_SIZE + fields.len() * IFD_ENTRY_SIZE + IFD_NEXT_OFFSET_SIZE;
        let area_start = (TIFF_HEADER_SIZE + directory_size) as u64;

        let mut entries = Vec::with_capacity(fields.len());
        let mut value_area: Vec<u8> = Vec::new();

        for field in &fields {
            let bytes = field.value.to_le_bytes();
            let mut value_field = [0u8; 4];

            if field.value.fits_inline() {
                value_field[..bytes.len()].copy_from_slice(&bytes);
            } else {
                // Values start on a word boundary
                if (area_start + value_area.len() as u64) % 2 == 1 {
                    value_area.push(0);
                }
                let offset = area_start + value_area.len() as u64;
                value_field = checked_u32(offset)?.to_le_bytes();
                value_area.extend_from_slice(&bytes);
            }

            entries.push(PlacedEntry {
                tag: field.tag,
                field_type: field.value.field_type(),
                count: field.value.count(),
                value_field,
            });
        }

        if (area_start + value_area.len() as u64) % 2 == 1 {
            value_area.push(0);
        }
        let pixel_offset = area_start + value_area.len() as u64;
        let total = pixel_offset + pixel_len;
        if total > u32::MAX as u64 {
            return Err(EncodeError::TooLarge(total));
        }

        let pixel_offset = pixel_offset as u32;
        let pixel_len = pixel_len as u32;

        for entry in &mut entries {
            if entry.tag == TiffTag::StripOffsets.as_u16() {
                entry.value_field = pixel_offset.to_le_bytes();
            } else if entry.tag == TiffTag::StripByteCounts.as_u16() {
                entry.value_field = pixel_len.to_le_bytes();
            }
        }

        Ok(Self {
            entries,
            value_area,
            pixel_offset,
            pixel_len,
        })
    }

    /// Serialize header, directory and value area, then the pixel strip.
    fn write_to<W: Write>(&self, out: &mut W, pixels: &[u8]) -> std::io::Result<()> {
        out.write_all(b"II")?;
        out.write_all(&VERSION_TIFF.to_le_bytes())?;
        out.write_all(&(TIFF_HEADER_SIZE as u32).to_le_bytes())?;

        out.write_all(&(self.entries.len() as u16).to_le_bytes())?;
        for entry in &self.entries {
            out.write_all(&entry.tag.to_le_bytes())?;
            out.write_all(&entry.field_type.as_u16().to_le_bytes())?;
            out.write_all(&entry.count.to_le_bytes())?;
            out.write_all(&entry.value_field)?;
        }
        out.write_all(&0u32.to_le_bytes())?;

        out.write_all(&self.value_area)?;
        out.write_all(pixels)
    }
}

fn checked_u32(value: u64) -> Result<u32, EncodeError> {
    u32::try_from(value).map_err(|_| EncodeError::TooLarge(value))
}

// =============================================================================
// GeoTiffEncoder
// =============================================================================

/// Writes an RGBA canvas and its geotransform as a GeoTIFF.
///
/// # Example
///
/// ```ignore
/// use tile_mosaic::format::tiff::{GeoTiffEncoder, web_mercator_geokeys};
///
/// let encoder = GeoTiffEncoder::new();
/// encoder.encode(&canvas, "out.tif".as_ref(), &transform, &web_mercator_geokeys())?;
/// ```
#[derive(Debug, Clone)]
pub struct GeoTiffEncoder {
    software: Option<String>,
}

impl Default for GeoTiffEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoTiffEncoder {
    /// Create an encoder that stamps the crate name into the Software tag.
    pub fn new() -> Self {
        Self {
            software: Some(format!("tile-mosaic {}", env!("CARGO_PKG_VERSION"))),
        }
    }

    /// Omit the Software tag.
    pub fn without_software(mut self) -> Self {
        self.software = None;
        self
    }

    /// Encode `canvas` to `path`.
    ///
    /// The file is written to a temporary sibling and renamed into place only
    /// after the last byte is synced, so a failed write never leaves a
    /// partial raster under `path`.
    pub fn encode(
        &self,
        canvas: &RgbaImage,
        path: &Path,
        transform: &GeoTransform,
        extra_tags: &[TiffField],
    ) -> Result<(), EncodeError> {
        let layout = self.layout(canvas, transform, extra_tags)?;

        let mut file = AtomicFile::create(path).map_err(|e| EncodeError::io(path, e))?;
        layout
            .write_to(&mut file, canvas.as_raw())
            .map_err(|e| EncodeError::io(path, e))?;
        file.commit().map_err(|e| EncodeError::io(path, e))?;

        debug!(
            path = %path.display(),
            width = canvas.width(),
            height = canvas.height(),
            entries = layout.entries.len(),
            pixel_offset = layout.pixel_offset,
            "Wrote georeferenced raster"
        );

        Ok(())
    }

    /// Encode `canvas` into memory.
    pub fn encode_to_vec(
        &self,
        canvas: &RgbaImage,
        transform: &GeoTransform,
        extra_tags: &[TiffField],
    ) -> Result<Vec<u8>, EncodeError> {
        let layout = self.layout(canvas, transform, extra_tags)?;

        let total = layout.pixel_offset as usize + layout.pixel_len as usize;
        let mut out = Vec::with_capacity(total);
        layout
            .write_to(&mut out, canvas.as_raw())
            .map_err(|e| EncodeError::io("<memory>", e))?;

        Ok(out)
    }

    fn layout(
        &self,
        canvas: &RgbaImage,
        transform: &GeoTransform,
        extra_tags: &[TiffField],
    ) -> Result<FileLayout, EncodeError> {
        let (width, height) = canvas.dimensions();
        if width == 0 || height == 0 {
            return Err(EncodeError::InvalidCanvas(format!(
                "zero dimension {}x{}",
                width, height
            )));
        }

        let pixel_len = width as u64 * height as u64 * SAMPLES_PER_PIXEL as u64;
        if canvas.as_raw().len() as u64 != pixel_len {
            return Err(EncodeError::InvalidCanvas(format!(
                "buffer holds {} bytes, expected {}",
                canvas.as_raw().len(),
                pixel_len
            )));
        }

        let mut fields = self.baseline_fields(width, height);
        fields.extend(transform_fields(transform));
        fields.extend(extra_tags.iter().cloned());

        FileLayout::build(fields, pixel_len)
    }

    fn baseline_fields(&self, width: u32, height: u32) -> Vec<TiffField> {
        let mut fields = vec![
            TiffField::known(TiffTag::ImageWidth, TagValue::Longs(vec![width])),
            TiffField::known(TiffTag::ImageLength, TagValue::Longs(vec![height])),
            TiffField::known(
                TiffTag::BitsPerSample,
                TagValue::Shorts(vec![BITS_PER_SAMPLE; SAMPLES_PER_PIXEL as usize]),
            ),
            TiffField::known(TiffTag::Compression, TagValue::Shorts(vec![COMPRESSION_NONE])),
            TiffField::known(
                TiffTag::PhotometricInterpretation,
                TagValue::Shorts(vec![PHOTOMETRIC_RGB]),
            ),
            // Placeholder, resolved once the value area is laid out
            TiffField::known(TiffTag::StripOffsets, TagValue::Longs(vec![0])),
            TiffField::known(
                TiffTag::SamplesPerPixel,
                TagValue::Shorts(vec![SAMPLES_PER_PIXEL]),
            ),
            TiffField::known(TiffTag::RowsPerStrip, TagValue::Longs(vec![height])),
            // Placeholder, resolved once the value area is laid out
            TiffField::known(TiffTag::StripByteCounts, TagValue::Longs(vec![0])),
            TiffField::known(TiffTag::XResolution, TagValue::Rationals(vec![(1, 1)])),
            TiffField::known(TiffTag::YResolution, TagValue::Rationals(vec![(1, 1)])),
            TiffField::known(
                TiffTag::PlanarConfiguration,
                TagValue::Shorts(vec![PLANAR_CHUNKY]),
            ),
            TiffField::known(
                TiffTag::ResolutionUnit,
                TagValue::Shorts(vec![RESOLUTION_UNIT_NONE]),
            ),
            TiffField::known(
                TiffTag::ExtraSamples,
                TagValue::Shorts(vec![EXTRA_SAMPLE_UNASSOCIATED_ALPHA]),
            ),
        ];

        if let Some(ref software) = self.software {
            fields.push(TiffField::known(
                TiffTag::Software,
                TagValue::Ascii(software.clone()),
            ));
        }

        fields
    }
}

/// ModelPixelScale and ModelTiepoint for a north-up geotransform.
///
/// GeoTIFF stores the Y scale as a positive number; the geotransform's
/// negative pixel height is flipped here.
fn transform_fields(transform: &GeoTransform) -> [TiffField; 2] {
    [
        TiffField::known(
            TiffTag::ModelPixelScale,
            TagValue::Doubles(vec![transform.pixel_width, -transform.pixel_height, 0.0]),
        ),
        TiffField::known(
            TiffTag::ModelTiepoint,
            TagValue::Doubles(vec![
                0.0,
                0.0,
                0.0,
                transform.origin_x,
                transform.origin_y,
                0.0,
            ]),
        ),
    ]
}

/// Write `canvas` as a plain TIFF without georeferencing.
///
/// The pixels are re-encoded by the `image` codec, for tools that only need
/// the picture.
pub fn write_preview(canvas: &RgbaImage, path: &Path) -> Result<(), EncodeError> {
    let mut buffer = Cursor::new(Vec::new());
    canvas
        .write_to(&mut buffer, image::ImageFormat::Tiff)
        .map_err(|e| EncodeError::Preview(e.to_string()))?;

    write_atomic_blocking(path, buffer.get_ref()).map_err(|e| EncodeError::io(path, e))
}

// =============================================================================
// Tests
// =============================================================================
