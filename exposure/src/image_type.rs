//! Image types and their shutter handling.

use std::fmt;

use hardware::ShutterState;
use serde::{Deserialize, Serialize};

/// Kind of exposure being taken.
///
/// Any name outside the standard set is a comparison-lamp exposure named
/// after the lamps to switch on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageType {
    Zero,
    #[default]
    Object,
    Flat,
    Dark,
    /// Normal integration, then readout with the shutter open
    Ramp,
    Tdi,
    Comp(String),
}

impl ImageType {
    /// Parse an image type name, case-insensitively.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "zero" => ImageType::Zero,
            "object" => ImageType::Object,
            "flat" => ImageType::Flat,
            "dark" => ImageType::Dark,
            "ramp" => ImageType::Ramp,
            "tdi" => ImageType::Tdi,
            _ => ImageType::Comp(name.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ImageType::Zero => "zero",
            ImageType::Object => "object",
            ImageType::Flat => "flat",
            ImageType::Dark => "dark",
            ImageType::Ramp => "ramp",
            ImageType::Tdi => "tdi",
            ImageType::Comp(name) => name,
        }
    }

    /// Shutter position during integration; comp exposures open the shutter.
    pub fn shutter_state(&self) -> ShutterState {
        match self {
            ImageType::Zero | ImageType::Dark | ImageType::Ramp => ShutterState::Closed,
            ImageType::Object | ImageType::Flat | ImageType::Tdi | ImageType::Comp(_) => {
                ShutterState::Open
            }
        }
    }

    pub fn is_comp(&self) -> bool {
        matches!(self, ImageType::Comp(_))
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
