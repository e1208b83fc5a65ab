//! Detector geometry: readout format, region of interest and focal plane layout.
//!
//! The controller reads the detector out through one or more amplifiers. Each
//! amplifier delivers a rectangular block of the final image; the blocks are
//! tiled into a grid of `amps_x` by `amps_y` to assemble the full frame.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised when a geometry description is inconsistent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    /// Region of interest does not fit the detector format.
    #[error("Invalid ROI: {0}")]
    InvalidRoi(String),

    /// Detector format values are out of range.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Focal plane layout cannot be tiled.
    #[error("Invalid focal plane: {0}")]
    InvalidFocalPlane(String),
}

/// Result type for geometry operations.
pub type GeometryResult<T> = Result<T, GeometryError>;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Image width (columns)
    pub width: usize,
    /// Image height (rows)
    pub height: usize,
}

impl ImageSize {
    /// Create a new ImageSize
    pub fn from_width_height(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Get total number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Serial/parallel readout format of a single detector.
///
/// Values follow the nine-argument `setformat` command: serial total, predark,
/// underscan and overscan, then parallel total, predark, underscan, overscan
/// and frame-transfer rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorFormat {
    pub ns_total: usize,
    pub ns_predark: usize,
    pub ns_underscan: usize,
    pub ns_overscan: usize,
    pub np_total: usize,
    pub np_predark: usize,
    pub np_underscan: usize,
    pub np_overscan: usize,
    pub np_frametransfer: usize,
}

impl DetectorFormat {
    /// Build a format from the nine signed values of a `setformat` command.
    pub fn from_values(values: [i64; 9]) -> GeometryResult<Self> {
        if let Some(bad) = values.iter().find(|v| **v < 0) {
            return Err(GeometryError::InvalidFormat(format!(
                "negative format value {bad}"
            )));
        }
        if values[0] == 0 || values[4] == 0 {
            return Err(GeometryError::InvalidFormat(
                "serial and parallel totals must be non-zero".to_string(),
            ));
        }
        let v = values.map(|v| v as usize);
        Ok(Self {
            ns_total: v[0],
            ns_predark: v[1],
            ns_underscan: v[2],
            ns_overscan: v[3],
            np_total: v[4],
            np_predark: v[5],
            np_underscan: v[6],
            np_overscan: v[7],
            np_frametransfer: v[8],
        })
    }
}

/// Region of interest, 1-based and inclusive, with binning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub first_col: usize,
    pub last_col: usize,
    pub first_row: usize,
    pub last_row: usize,
    pub col_bin: usize,
    pub row_bin: usize,
}

impl Roi {
    /// Unbinned full-frame ROI for a detector format.
    pub fn full_frame(format: &DetectorFormat) -> Self {
        Self {
            first_col: 1,
            last_col: format.ns_total,
            first_row: 1,
            last_row: format.np_total,
            col_bin: 1,
            row_bin: 1,
        }
    }

    /// Build an ROI from the six signed values of a `setroi` command.
    pub fn from_values(values: [i64; 6]) -> GeometryResult<Self> {
        if let Some(bad) = values.iter().find(|v| **v < 1) {
            return Err(GeometryError::InvalidRoi(format!(
                "ROI values must be positive, got {bad}"
            )));
        }
        let v = values.map(|v| v as usize);
        Ok(Self {
            first_col: v[0],
            last_col: v[1],
            first_row: v[2],
            last_row: v[3],
            col_bin: v[4],
            row_bin: v[5],
        })
    }

    /// Check the ROI against the detector format.
    pub fn validate(&self, format: &DetectorFormat) -> GeometryResult<()> {
        if self.col_bin == 0 || self.row_bin == 0 {
            return Err(GeometryError::InvalidRoi("binning must be >= 1".to_string()));
        }
        if self.first_col == 0 || self.first_col > self.last_col || self.last_col > format.ns_total
        {
            return Err(GeometryError::InvalidRoi(format!(
                "columns {}..{} outside 1..{}",
                self.first_col, self.last_col, format.ns_total
            )));
        }
        if self.first_row == 0 || self.first_row > self.last_row || self.last_row > format.np_total
        {
            return Err(GeometryError::InvalidRoi(format!(
                "rows {}..{} outside 1..{}",
                self.first_row, self.last_row, format.np_total
            )));
        }
        Ok(())
    }

    /// Number of binned image columns covered by the ROI.
    pub fn binned_cols(&self) -> usize {
        (self.last_col - self.first_col + 1) / self.col_bin
    }

    /// Number of binned image rows covered by the ROI.
    pub fn binned_rows(&self) -> usize {
        (self.last_row - self.first_row + 1) / self.row_bin
    }
}

/// Amplifier readout orientation, one digit per amplifier in the
/// configuration string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmpFlip {
    pub flip_x: bool,
    pub flip_y: bool,
}

/// Layout of detectors and amplifiers on the focal plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocalPlane {
    pub detectors_x: usize,
    pub detectors_y: usize,
    pub amps_x: usize,
    pub amps_y: usize,
    /// One digit per amplifier: 0 normal, 1 flip x, 2 flip y, 3 flip both.
    pub amp_config: String,
}

impl FocalPlane {
    /// Single detector read through one amplifier.
    pub fn single_amp() -> Self {
        Self {
            detectors_x: 1,
            detectors_y: 1,
            amps_x: 1,
            amps_y: 1,
            amp_config: "0".to_string(),
        }
    }

    /// Build a focal plane, validating the amplifier configuration string.
    pub fn new(
        detectors_x: usize,
        detectors_y: usize,
        amps_x: usize,
        amps_y: usize,
        amp_config: &str,
    ) -> GeometryResult<Self> {
        if detectors_x == 0 || detectors_y == 0 || amps_x == 0 || amps_y == 0 {
            return Err(GeometryError::InvalidFocalPlane(
                "detector and amplifier counts must be >= 1".to_string(),
            ));
        }
        let plane = Self {
            detectors_x,
            detectors_y,
            amps_x,
            amps_y,
            amp_config: amp_config.to_string(),
        };
        if amp_config.len() != plane.num_amps() {
            return Err(GeometryError::InvalidFocalPlane(format!(
                "amp config '{amp_config}' does not describe {} amplifiers",
                plane.num_amps()
            )));
        }
        if let Some(c) = amp_config.chars().find(|c| !('0'..='3').contains(c)) {
            return Err(GeometryError::InvalidFocalPlane(format!(
                "unknown amplifier code '{c}'"
            )));
        }
        Ok(plane)
    }

    /// Amplifiers across the whole focal plane, horizontally.
    pub fn total_amps_x(&self) -> usize {
        self.detectors_x * self.amps_x
    }

    /// Amplifiers across the whole focal plane, vertically.
    pub fn total_amps_y(&self) -> usize {
        self.detectors_y * self.amps_y
    }

    /// Total number of amplifiers read out.
    pub fn num_amps(&self) -> usize {
        self.total_amps_x() * self.total_amps_y()
    }

    /// Orientation of amplifier `index`; unknown entries read as normal.
    pub fn amp_flip(&self, index: usize) -> AmpFlip {
        let code = self
            .amp_config
            .chars()
            .nth(index)
            .and_then(|c| c.to_digit(10))
            .unwrap_or(0);
        AmpFlip {
            flip_x: code & 1 != 0,
            flip_y: code & 2 != 0,
        }
    }
}

/// Complete readout geometry: format, ROI and focal plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub format: DetectorFormat,
    pub roi: Roi,
    pub focal_plane: FocalPlane,
}

impl Geometry {
    /// Full-frame geometry for a single-amplifier detector.
    pub fn new(format: DetectorFormat) -> Self {
        Self {
            format,
            roi: Roi::full_frame(&format),
            focal_plane: FocalPlane::single_amp(),
        }
    }

    /// Check that ROI and focal plane tile cleanly.
    pub fn validate(&self) -> GeometryResult<()> {
        self.roi.validate(&self.format)?;
        let size = self.image_size();
        if size.width % self.focal_plane.total_amps_x() != 0
            || size.height % self.focal_plane.total_amps_y() != 0
        {
            return Err(GeometryError::InvalidFocalPlane(format!(
                "image {size} cannot be split across {}x{} amplifiers",
                self.focal_plane.total_amps_x(),
                self.focal_plane.total_amps_y()
            )));
        }
        Ok(())
    }

    /// Size of the assembled image, including under/overscan per amplifier.
    pub fn image_size(&self) -> ImageSize {
        let width = self.roi.binned_cols()
            + (self.format.ns_underscan + self.format.ns_overscan)
                * self.focal_plane.total_amps_x();
        let height = self.roi.binned_rows()
            + (self.format.np_underscan + self.format.np_overscan)
                * self.focal_plane.total_amps_y();
        ImageSize::from_width_height(width, height)
    }

    /// Size of the block read through a single amplifier.
    pub fn amp_size(&self) -> ImageSize {
        let size = self.image_size();
        ImageSize::from_width_height(
            size.width / self.focal_plane.total_amps_x(),
            size.height / self.focal_plane.total_amps_y(),
        )
    }

    pub fn num_amps(&self) -> usize {
        self.focal_plane.num_amps()
    }

    /// Total pixels read out per exposure.
    pub fn num_pix_image(&self) -> usize {
        self.image_size().pixel_count()
    }

    /// Pixels read through each amplifier.
    pub fn num_pix_amp(&self) -> usize {
        self.amp_size().pixel_count()
    }
}

/// Named detector description stored alongside the server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorParameters {
    pub name: String,
    pub description: String,
    pub geometry: Geometry,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bluechan_format() -> DetectorFormat {
        DetectorFormat::from_values([2688, 16, 0, 20, 512, 0, 0, 0, 0]).unwrap()
    }

    #[test]
    fn test_full_frame_size_includes_overscan() {
        let geometry = Geometry::new(bluechan_format());
        assert_eq!(geometry.image_size(), ImageSize::from_width_height(2708, 512));
        assert_eq!(geometry.num_pix_image(), 2708 * 512);
        assert_eq!(geometry.num_amps(), 1);
    }

    #[test]
    fn test_binned_roi() {
        let mut geometry = Geometry::new(bluechan_format());
        geometry.roi = Roi::from_values([1, 1000, 1, 200, 2, 2]).unwrap();
        geometry.validate().unwrap();
        assert_eq!(geometry.roi.binned_cols(), 500);
        assert_eq!(geometry.roi.binned_rows(), 100);
    }

    #[test]
    fn test_roi_outside_detector_rejected() {
        let roi = Roi::from_values([1, 3000, 1, 512, 1, 1]).unwrap();
        assert!(matches!(
            roi.validate(&bluechan_format()),
            Err(GeometryError::InvalidRoi(_))
        ));
        assert!(Roi::from_values([0, 10, 1, 10, 1, 1]).is_err());
    }

    #[test]
    fn test_negative_format_rejected() {
        assert!(DetectorFormat::from_values([100, -1, 0, 0, 100, 0, 0, 0, 0]).is_err());
        assert!(DetectorFormat::from_values([0, 0, 0, 0, 100, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_two_amp_layout() {
        let format = DetectorFormat::from_values([64, 0, 0, 0, 32, 0, 0, 0, 0]).unwrap();
        let mut geometry = Geometry::new(format);
        geometry.focal_plane = FocalPlane::new(1, 1, 2, 1, "01").unwrap();
        geometry.validate().unwrap();
        assert_eq!(geometry.amp_size(), ImageSize::from_width_height(32, 32));
        assert_eq!(geometry.num_pix_amp(), 1024);
        assert!(!geometry.focal_plane.amp_flip(0).flip_x);
        assert!(geometry.focal_plane.amp_flip(1).flip_x);
    }

    #[test]
    fn test_amp_config_length_checked() {
        assert!(FocalPlane::new(1, 1, 2, 1, "0").is_err());
        assert!(FocalPlane::new(1, 1, 1, 1, "7").is_err());
    }
}
