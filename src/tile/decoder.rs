//! Tile image decoding.
//!
//! Providers serve JPEG, PNG or WebP. Every fetched tile is decoded to RGBA8
//! and brought to the grid's tile size before it is drawn on a canvas.

use image::imageops::{self, FilterType};
use image::RgbaImage;

use crate::error::TileError;

/// Decode an encoded tile into an RGBA image of `tile_size` x `tile_size`.
///
/// Tiles served at another size are resampled.
pub fn decode_tile(bytes: &[u8], tile_size: u32) -> Result<RgbaImage, TileError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| TileError::DecodeError {
            message: e.to_string(),
        })?
        .to_rgba8();

    if image.dimensions() == (tile_size, tile_size) {
        Ok(image)
    } else {
        Ok(imageops::resize(&image, tile_size, tile_size, FilterType::Triangle))
    }
}

/// Extract and upscale the part of an ancestor tile that covers a descendant.
///
/// `ancestor` was served `levels` zoom levels above the descendant at
/// `(col, row)`; rows are TMS rows. The matching sub-square is cropped and
/// scaled back up to `tile_size`.
pub fn crop_from_ancestor(
    ancestor: &RgbaImage,
    levels: u8,
    col: u32,
    row: u32,
    tile_size: u32,
) -> RgbaImage {
    if levels == 0 {
        return ancestor.clone();
    }

    let span = 1u32 << levels.min(31);
    let mask = span - 1;
    let sub_col = col & mask;
    // TMS rows count from the bottom, image rows from the top
    let sub_row_from_top = mask - (row & mask);

    let (width, height) = ancestor.dimensions();
    let sub_width = (width / span).max(1);
    let sub_height = (height / span).max(1);
    let x = (sub_col * sub_width).min(width.saturating_sub(sub_width));
    let y = (sub_row_from_top * sub_height).min(height.saturating_sub(sub_height));

    let cropped = imageops::crop_imm(ancestor, x, y, sub_width, sub_height).to_image();
    imageops::resize(&cropped, tile_size, tile_size, FilterType::Triangle)
}
