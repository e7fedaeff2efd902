//! Typed tag values.
//!
//! A [`TagValue`] is the payload of one directory entry. The writer turns it
//! into little-endian bytes; the reader turns raw entry bytes back into a
//! `TagValue` respecting the file's byte order.

use serde::Serialize;

use super::parser::ByteOrder;
use super::tags::FieldType;

/// Payload of a single directory entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum TagValue {
    /// BYTE array
    Bytes(Vec<u8>),

    /// SHORT array
    Shorts(Vec<u16>),

    /// LONG array
    Longs(Vec<u32>),

    /// RATIONAL array as (numerator, denominator) pairs
    Rationals(Vec<(u32, u32)>),

    /// DOUBLE array
    Doubles(Vec<f64>),

    /// Text, written with a trailing null terminator
    Ascii(String),
}

impl TagValue {
    /// Field type used to encode this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            TagValue::Bytes(_) => FieldType::Byte,
            TagValue::Shorts(_) => FieldType::Short,
            TagValue::Longs(_) => FieldType::Long,
            TagValue::Rationals(_) => FieldType::Rational,
            TagValue::Doubles(_) => FieldType::Double,
            TagValue::Ascii(_) => FieldType::Ascii,
        }
    }

    /// Number of values as recorded in the entry's count field.
    ///
    /// ASCII counts include the null terminator.
    pub fn count(&self) -> u32 {
        let count = match self {
            TagValue::Bytes(v) => v.len(),
            TagValue::Shorts(v) => v.len(),
            TagValue::Longs(v) => v.len(),
            TagValue::Rationals(v) => v.len(),
            TagValue::Doubles(v) => v.len(),
            TagValue::Ascii(s) => s.len() + 1,
        };
        count as u32
    }

    /// Whether the value carries no elements at all.
    pub fn is_empty(&self) -> bool {
        match self {
            TagValue::Ascii(_) => false,
            _ => self.count() == 0,
        }
    }

    /// Total encoded size in bytes.
    pub fn byte_len(&self) -> usize {
        self.field_type().size_in_bytes() * self.count() as usize
    }

    /// Whether the encoded payload fits in the entry's 4-byte value field.
    pub fn fits_inline(&self) -> bool {
        self.byte_len() <= FieldType::INLINE_THRESHOLD
    }

    /// Encode the payload as little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        match self {
            TagValue::Bytes(v) => out.extend_from_slice(v),
            TagValue::Shorts(v) => v.iter().for_each(|x| out.extend(x.to_le_bytes())),
            TagValue::Longs(v) => v.iter().for_each(|x| out.extend(x.to_le_bytes())),
            TagValue::Rationals(v) => v.iter().for_each(|(n, d)| {
                out.extend(n.to_le_bytes());
                out.extend(d.to_le_bytes());
            }),
            TagValue::Doubles(v) => v.iter().for_each(|x| out.extend(x.to_le_bytes())),
            TagValue::Ascii(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
        }
        out
    }

    /// Decode `count` values of `field_type` from raw bytes.
    ///
    /// `bytes` must hold at least `count * field_type.size_in_bytes()` bytes.
    pub fn decode(field_type: FieldType, count: usize, bytes: &[u8], order: ByteOrder) -> Self {
        let size = field_type.size_in_bytes();
        let chunks = bytes.chunks_exact(size).take(count);

        match field_type {
            FieldType::Byte | FieldType::Undefined => TagValue::Bytes(bytes[..count].to_vec()),
            FieldType::Ascii => {
                let raw = &bytes[..count];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                TagValue::Ascii(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
            FieldType::Short => TagValue::Shorts(chunks.map(|c| order.read_u16(c)).collect()),
            FieldType::Long => TagValue::Longs(chunks.map(|c| order.read_u32(c)).collect()),
            FieldType::Rational => TagValue::Rationals(
                chunks
                    .map(|c| (order.read_u32(&c[..4]), order.read_u32(&c[4..])))
                    .collect(),
            ),
            FieldType::Double => TagValue::Doubles(
                chunks
                    .map(|c| f64::from_bits(order.read_u64(c)))
                    .collect(),
            ),
        }
    }

    /// First value widened to u64, for integer-typed entries.
    pub fn first_u64(&self) -> Option<u64> {
        match self {
            TagValue::Bytes(v) => v.first().map(|&x| x as u64),
            TagValue::Shorts(v) => v.first().map(|&x| x as u64),
            TagValue::Longs(v) => v.first().map(|&x| x as u64),
            _ => None,
        }
    }

    /// Values as f64, for DOUBLE entries.
    pub fn as_doubles(&self) -> Option<&[f64]> {
        match self {
            TagValue::Doubles(v) => Some(v),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
