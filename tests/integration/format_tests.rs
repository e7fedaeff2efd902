//! GeoTIFF encoder integration tests.
//!
//! Tests verify:
//! - Written rasters decode with an independent TIFF reader
//! - Caller-supplied tags are merged into the sorted directory
//! - GeoKeys describe projected and geographic systems
//! - Invalid tag sets are rejected before anything is written

use image::{Rgba, RgbaImage};

use tile_mosaic::error::EncodeError;
use tile_mosaic::format::tiff::{geokeys_for_epsg, EPSG_WGS84};
use tile_mosaic::{read_directory, GeoTiffEncoder, GeoTransform, TagValue, TiffField, TiffTag};

use super::test_utils::read_raster;

fn gradient(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 16) as u8, (y * 16) as u8, 128, if (x + y) % 2 == 0 { 255 } else { 64 }])
    })
}

fn transform() -> GeoTransform {
    GeoTransform {
        origin_x: -8_240_000.0,
        origin_y: 4_970_000.0,
        pixel_width: 2.5,
        pixel_height: -2.5,
    }
}

#[test]
fn test_raster_decodes_with_image_crate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.tif");
    let canvas = gradient(13, 7);

    GeoTiffEncoder::new()
        .encode(&canvas, &path, &transform(), &[])
        .unwrap();

    let decoded = read_raster(&path);
    assert_eq!(decoded.dimensions(), (13, 7));
    assert_eq!(decoded.as_raw(), canvas.as_raw());
}

#[test]
fn test_extra_tags_merged_in_order() {
    let canvas = gradient(4, 4);
    let mut tags = geokeys_for_epsg(EPSG_WGS84);
    tags.push(TiffField::known(
        TiffTag::ImageDescription,
        TagValue::Ascii("lower manhattan".to_string()),
    ));
    tags.push(TiffField::new(65000, TagValue::Longs(vec![1, 2, 3])));

    let bytes = GeoTiffEncoder::new()
        .encode_to_vec(&canvas, &transform(), &tags)
        .unwrap();
    let ifd = read_directory(&bytes).unwrap();

    let ids = ifd.tags();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    assert_eq!(ids.last(), Some(&65000));

    assert_eq!(
        ifd.value(TiffTag::ImageDescription),
        Some(&TagValue::Ascii("lower manhattan".to_string()))
    );
    assert_eq!(ifd.get(65000).unwrap().value, Some(TagValue::Longs(vec![1, 2, 3])));

    // Geographic model for EPSG:4326
    match ifd.value(TiffTag::GeoKeyDirectory) {
        Some(TagValue::Shorts(keys)) => {
            assert_eq!(&keys[..4], &[1, 1, 0, 4]);
            assert_eq!(&keys[4..8], &[1024, 0, 1, 2]);
            assert!(keys.ends_with(&[2048, 0, 1, 4326]));
        }
        other => panic!("unexpected GeoKeyDirectory {:?}", other),
    }
}

#[test]
fn test_pixels_follow_value_area() {
    let canvas = gradient(5, 3);
    let bytes = GeoTiffEncoder::new()
        .encode_to_vec(&canvas, &transform(), &[])
        .unwrap();
    let ifd = read_directory(&bytes).unwrap();

    let offset = ifd.u64_value(TiffTag::StripOffsets).unwrap() as usize;
    let count = ifd.u64_value(TiffTag::StripByteCounts).unwrap() as usize;

    assert_eq!(offset % 2, 0);
    assert_eq!(count, 5 * 3 * 4);
    assert_eq!(offset + count, bytes.len());
    assert_eq!(&bytes[offset..], canvas.as_raw().as_slice());
}

#[test]
fn test_duplicate_caller_tag_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.tif");
    let tags = [TiffField::known(TiffTag::ImageWidth, TagValue::Longs(vec![99]))];

    let result = GeoTiffEncoder::new().encode(&gradient(2, 2), &path, &transform(), &tags);

    assert!(matches!(result, Err(EncodeError::DuplicateTag(256))));
    assert!(!path.exists());
}

#[test]
fn test_empty_caller_tag_rejected() {
    let tags = [TiffField::new(40000, TagValue::Doubles(Vec::new()))];
    let result = GeoTiffEncoder::new().encode_to_vec(&gradient(2, 2), &transform(), &tags);
    assert!(matches!(result, Err(EncodeError::EmptyValue(40000))));
}
