//! Raster assembly: grid bounds, canvas drawing and georeferencing.

mod canvas;
mod geotransform;

pub use canvas::{Canvas, GridBounds};
pub use geotransform::GeoTransform;
