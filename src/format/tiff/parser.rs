//! TIFF header and directory reading.
//!
//! The reader exists to verify what the writer produced: it parses the
//! classic TIFF header and the first image file directory from an in-memory
//! buffer, resolving inline and out-of-line values.
//!
//! # TIFF Header Structure
//!
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (42 = 0x002A)
//! Bytes 4-7: Offset to first IFD (4 bytes)
//! ```
//!
//! # IFD Entry Structure
//!
//! ```text
//! Bytes 0-1:  Tag ID
//! Bytes 2-3:  Field type
//! Bytes 4-7:  Value count
//! Bytes 8-11: Value if it fits in 4 bytes, else offset to the value
//! ```

use serde::Serialize;

use crate::error::TiffError;

use super::tags::{FieldType, TiffTag};
use super::values::TagValue;

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes indicating little-endian byte order ("II" for Intel)
const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM" for Motorola)
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

/// Version number for classic TIFF
pub const VERSION_TIFF: u16 = 42;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of one directory entry in bytes
pub const IFD_ENTRY_SIZE: usize = 12;

/// Size of the entry count field at the start of a directory
pub const IFD_COUNT_SIZE: usize = 2;

/// Size of the next-directory offset at the end of a directory
pub const IFD_NEXT_OFFSET_SIZE: usize = 4;

// =============================================================================
// ByteOrder
// =============================================================================

/// Byte order (endianness) of a TIFF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ByteOrder {
    /// Little-endian ("II" = Intel)
    LittleEndian,
    /// Big-endian ("MM" = Motorola)
    BigEndian,
}

impl ByteOrder {
    /// Read a u16 from the first 2 bytes of `bytes`.
    ///
    /// # Panics
    /// Panics if the slice has fewer than 2 bytes.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        let raw = [bytes[0], bytes[1]];
        match self {
            ByteOrder::LittleEndian => u16::from_le_bytes(raw),
            ByteOrder::BigEndian => u16::from_be_bytes(raw),
        }
    }

    /// Read a u32 from the first 4 bytes of `bytes`.
    ///
    /// # Panics
    /// Panics if the slice has fewer than 4 bytes.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::LittleEndian => u32::from_le_bytes(raw),
            ByteOrder::BigEndian => u32::from_be_bytes(raw),
        }
    }

    /// Read a u64 from the first 8 bytes of `bytes`.
    ///
    /// # Panics
    /// Panics if the slice has fewer than 8 bytes.
    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        match self {
            ByteOrder::LittleEndian => u64::from_le_bytes(raw),
            ByteOrder::BigEndian => u64::from_be_bytes(raw),
        }
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

/// Parsed classic TIFF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TiffHeader {
    /// Byte order for all multi-byte values in the file
    pub byte_order: ByteOrder,

    /// Offset to the first IFD in the file
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a TIFF header from the start of a file.
    ///
    /// # Errors
    /// - `FileTooSmall` if there aren't 8 bytes
    /// - `InvalidMagic` if byte order bytes are not II or MM
    /// - `InvalidVersion` if the version is not 42 (BigTIFF is not read)
    /// - `InvalidIfdOffset` if the first IFD offset is outside the file
    pub fn parse(bytes: &[u8]) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        // Checked as raw byte patterns, independent of the order they announce
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        let version = byte_order.read_u16(&bytes[2..4]);
        if version != VERSION_TIFF {
            return Err(TiffError::InvalidVersion(version));
        }

        let first_ifd_offset = byte_order.read_u32(&bytes[4..8]) as u64;
        if first_ifd_offset < TIFF_HEADER_SIZE as u64 || first_ifd_offset >= bytes.len() as u64 {
            return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
        }

        Ok(TiffHeader {
            byte_order,
            first_ifd_offset,
        })
    }
}

// =============================================================================
// Directory
// =============================================================================

/// One decoded directory entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IfdEntry {
    /// Tag ID
    pub tag: u16,

    /// Raw field type ID
    pub field_type: u16,

    /// Number of values
    pub count: u32,

    /// Whether the value was stored in the entry itself
    pub is_inline: bool,

    /// Absolute offset of the value when stored out of line
    pub value_offset: Option<u32>,

    /// Decoded value, `None` for field types this crate does not read
    pub value: Option<TagValue>,
}

impl IfdEntry {
    /// Known tag for this entry, if any.
    pub fn known_tag(&self) -> Option<TiffTag> {
        TiffTag::from_u16(self.tag)
    }

    /// Display name: the known tag name or the numeric ID.
    pub fn tag_name(&self) -> String {
        match self.known_tag() {
            Some(tag) => tag.name().to_string(),
            None => format!("Tag{}", self.tag),
        }
    }
}

/// The first image file directory of a TIFF file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ifd {
    /// Header the directory was located from
    pub header: TiffHeader,

    /// Entries in file order
    pub entries: Vec<IfdEntry>,

    /// Offset of the next directory (0 when this is the last)
    pub next_ifd_offset: u32,
}

impl Ifd {
    /// Find an entry by tag.
    pub fn get(&self, tag: u16) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag == tag)
    }

    /// Decoded value of a tag.
    pub fn value(&self, tag: TiffTag) -> Option<&TagValue> {
        self.get(tag.as_u16()).and_then(|e| e.value.as_ref())
    }

    /// First integer value of a tag.
    pub fn u64_value(&self, tag: TiffTag) -> Option<u64> {
        self.value(tag).and_then(TagValue::first_u64)
    }

    /// Tag IDs in file order.
    pub fn tags(&self) -> Vec<u16> {
        self.entries.iter().map(|e| e.tag).collect()
    }
}

/// Parse the header and first directory of a TIFF file held in memory.
pub fn read_directory(bytes: &[u8]) -> Result<Ifd, TiffError> {
    let header = TiffHeader::parse(bytes)?;
    let order = header.byte_order;
    let start = header.first_ifd_offset as usize;

    let count_end = start + IFD_COUNT_SIZE;
    if count_end > bytes.len() {
        return Err(TiffError::InvalidIfdOffset(header.first_ifd_offset));
    }
    let entry_count = order.read_u16(&bytes[start..count_end]) as usize;

    let entries_end = count_end + entry_count * IFD_ENTRY_SIZE;
    if entries_end + IFD_NEXT_OFFSET_SIZE > bytes.len() {
        return Err(TiffError::FileTooSmall {
            required: (entries_end + IFD_NEXT_OFFSET_SIZE) as u64,
            actual: bytes.len() as u64,
        });
    }

    let mut entries = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        let at = count_end + i * IFD_ENTRY_SIZE;
        entries.push(parse_entry(&bytes[at..at + IFD_ENTRY_SIZE], bytes, order)?);
    }

    let next_ifd_offset = order.read_u32(&bytes[entries_end..]);

    Ok(Ifd {
        header,
        entries,
        next_ifd_offset,
    })
}

fn parse_entry(raw: &[u8], file: &[u8], order: ByteOrder) -> Result<IfdEntry, TiffError> {
    let tag = order.read_u16(&raw[0..2]);
    let field_type_raw = order.read_u16(&raw[2..4]);
    let count = order.read_u32(&raw[4..8]);
    let value_field = &raw[8..12];

    let field_type = match FieldType::from_u16(field_type_raw) {
        Some(field_type) => field_type,
        None => {
            return Ok(IfdEntry {
                tag,
                field_type: field_type_raw,
                count,
                is_inline: false,
                value_offset: None,
                value: None,
            })
        }
    };

    let is_inline = field_type.fits_inline(count as u64);
    let byte_len = field_type.size_in_bytes() as u64 * count as u64;

    let (value_offset, bytes) = if is_inline {
        (None, value_field)
    } else {
        let offset = order.read_u32(value_field);
        let end = offset as u64 + byte_len;
        if end > file.len() as u64 {
            return Err(TiffError::ValueOutOfBounds {
                tag,
                offset: offset as u64,
                len: byte_len,
            });
        }
        (Some(offset), &file[offset as usize..end as usize])
    };

    Ok(IfdEntry {
        tag,
        field_type: field_type_raw,
        count,
        is_inline,
        value_offset,
        value: Some(TagValue::decode(field_type, count as usize, bytes, order)),
    })
}

// =============================================================================
// Tests
// =============================================================================
