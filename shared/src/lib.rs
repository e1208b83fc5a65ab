//! Shared image, geometry and configuration types for the CCD controller.
//!
//! # Features
//!
//! - `frame-writer` - FITS and multi-extension FITS output
//! - `config-storage` - JSON configuration under ~/.cf_config
//! - `full` - everything above (default)

pub mod filename;
pub mod geometry;
pub mod header;
pub mod image_writer;
pub mod pixel_buffer;

#[cfg(feature = "config-storage")]
pub mod config_storage;

pub use filename::{FileType, ImageFilename};
pub use geometry::{
    DetectorFormat, DetectorParameters, FocalPlane, Geometry, GeometryError, ImageSize, Roi,
};
pub use header::{Header, Keyword, KeywordValue};
pub use image_writer::{FileImageWriter, ImageError, ImageResult, ImageWriter};
pub use pixel_buffer::{PixelBuffer, PixelError, DEMO_RAMP_MODULUS};
