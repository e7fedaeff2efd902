//! GeoKey directory construction.
//!
//! The raster writer only stores the affine placement (pixel scale and tie
//! point). Which coordinate reference system those numbers live in is declared
//! through the GeoKey directory, passed to the writer as extra tags.

use super::tags::TiffTag;
use super::values::TagValue;
use super::writer::TiffField;

/// EPSG code of spherical Web Mercator.
pub const EPSG_WEB_MERCATOR: u32 = 3857;

/// EPSG code of WGS 84 geographic coordinates.
pub const EPSG_WGS84: u32 = 4326;

const KEY_DIRECTORY_VERSION: u16 = 1;
const KEY_REVISION: u16 = 1;
const MINOR_REVISION: u16 = 0;

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GT_CITATION: u16 = 1026;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// GeoKey directory and ASCII params declaring `epsg` as the model CRS.
///
/// 4326 is declared as a geographic model; every other code as projected.
pub fn geokeys_for_epsg(epsg: u32) -> Vec<TiffField> {
    let citation = match epsg {
        EPSG_WEB_MERCATOR => "WGS 84 / Pseudo-Mercator".to_string(),
        EPSG_WGS84 => "WGS 84".to_string(),
        other => format!("EPSG:{}", other),
    };
    // Each citation in GeoAsciiParams is terminated by a pipe
    let ascii = format!("{}|", citation);

    let (model_type, crs_key) = if epsg == EPSG_WGS84 {
        (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE)
    } else {
        (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE)
    };

    // Codes above u16::MAX would be user-defined; clamp to "user defined"
    let code = u16::try_from(epsg).unwrap_or(32767);

    let keys: [[u16; 4]; 4] = [
        [GT_MODEL_TYPE, 0, 1, model_type],
        [GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA],
        [GT_CITATION, TiffTag::GeoAsciiParams.as_u16(), ascii.len() as u16, 0],
        [crs_key, 0, 1, code],
    ];

    let mut directory = vec![
        KEY_DIRECTORY_VERSION,
        KEY_REVISION,
        MINOR_REVISION,
        keys.len() as u16,
    ];
    for key in keys {
        directory.extend_from_slice(&key);
    }

    vec![
        TiffField::known(TiffTag::GeoKeyDirectory, TagValue::Shorts(directory)),
        TiffField::known(TiffTag::GeoAsciiParams, TagValue::Ascii(ascii)),
    ]
}

/// GeoKeys for spherical Web Mercator, the CRS of every XYZ/TMS provider.
pub fn web_mercator_geokeys() -> Vec<TiffField> {
    geokeys_for_epsg(EPSG_WEB_MERCATOR)
}
