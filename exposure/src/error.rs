//! Exposure error taxonomy.
//!
//! Failures are values: every phase returns a [`PhaseResult`], where an
//! operator abort is [`PhaseOutcome::Aborted`] rather than an error.

use hardware::ControllerError;
use shared::geometry::GeometryError;
use shared::image_writer::ImageError;
use shared::pixel_buffer::PixelError;
use thiserror::Error;

use crate::delivery::DeliveryError;

/// Errors that end an exposure cycle.
#[derive(Error, Debug)]
pub enum ExposureError {
    /// Controller command failed (a busy controller has already been retried).
    #[error("Hardware error: {0}")]
    Hardware(#[from] ControllerError),

    #[error("Image write failed: {0}")]
    Image(#[from] ImageError),

    #[error("Pixel data error: {0}")]
    Pixel(#[from] PixelError),

    #[error("Invalid geometry: {0}")]
    Geometry(#[from] GeometryError),

    /// Sending the image to the remote server failed.
    #[error("Image delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for exposure operations.
pub type ExposureResult<T> = Result<T, ExposureError>;

/// How a phase ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    /// The cycle ended through an abort, with a short reason.
    Aborted(String),
}

impl PhaseOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, PhaseOutcome::Aborted(_))
    }
}

/// Result of a single exposure phase.
pub type PhaseResult = ExposureResult<PhaseOutcome>;
