//! CCD controller interface.
//!
//! The exposure sequencer drives the detector electronics exclusively through
//! [`CcdController`]. Concrete drivers are the in-process
//! [`SimulatedController`](crate::sim::SimulatedController) and, behind the
//! `camserver` feature, the TCP [`ArcController`](crate::camserver::ArcController).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shared::geometry::Geometry;
use shared::header::Header;
use thiserror::Error;

/// Errors reported by a controller driver.
///
/// Only [`ControllerError::Busy`] is considered transient; every other variant
/// is a hardware fault that ends the current exposure cycle.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Controller is temporarily unable to accept the command.
    #[error("Controller busy: {0}")]
    Busy(String),

    /// Low-level I/O error (socket read/write failure).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to establish a connection to the controller.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No response received within the timeout period.
    #[error("Timeout waiting for response")]
    Timeout,

    /// Controller rejected the command.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Response doesn't match the expected format.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Bulk pixel transfer failed or was incomplete.
    #[error("Image transfer failed: {0}")]
    Transfer(String),
}

impl ControllerError {
    /// True for failures worth retrying after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, ControllerError::Busy(_))
    }
}

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Shutter position requested for an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterState {
    Open,
    Closed,
}

impl fmt::Display for ShutterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShutterState::Open => write!(f, "open"),
            ShutterState::Closed => write!(f, "close"),
        }
    }
}

impl FromStr for ShutterState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "1" => Ok(ShutterState::Open),
            "close" | "closed" | "0" => Ok(ShutterState::Closed),
            other => Err(format!("Invalid shutter state: {other}")),
        }
    }
}

/// Command interface to the detector electronics.
pub trait CcdController: Send {
    /// Short identifier of the controller type, recorded in image headers.
    fn controller_type(&self) -> &str;

    /// Reset and initialize the controller.
    fn reset(&mut self) -> ControllerResult<()>;

    /// Whether [`reset`](Self::reset) has completed since the driver was created.
    fn is_reset(&self) -> bool;

    fn set_exposure_time(&mut self, seconds: f64) -> ControllerResult<()>;

    fn start_exposure(&mut self) -> ControllerResult<()>;

    /// Integration time remaining in seconds.
    fn exposure_time_remaining(&mut self) -> ControllerResult<f64>;

    fn exposure_abort(&mut self) -> ControllerResult<()>;

    fn exposure_pause(&mut self) -> ControllerResult<()>;

    fn exposure_resume(&mut self) -> ControllerResult<()>;

    fn start_readout(&mut self) -> ControllerResult<()>;

    fn readout_abort(&mut self) -> ControllerResult<()>;

    /// Receive `byte_count` bytes of pixel data, blocking until complete.
    fn receive_image_data(&mut self, byte_count: usize) -> ControllerResult<Vec<u8>>;

    /// Pixels still to be transferred in the current readout.
    fn pixels_remaining(&mut self) -> ControllerResult<usize>;

    fn set_shutter_state(&mut self, state: ShutterState) -> ControllerResult<()>;

    /// Route the configured amplifiers to the video processors.
    fn select_video_outputs(&mut self) -> ControllerResult<()>;

    /// Lower (`true`) or restore (`false`) the output drain bias voltages.
    fn set_bias_lowered(&mut self, lowered: bool) -> ControllerResult<()>;

    /// Clear accumulated charge from the detector.
    fn flush(&mut self) -> ControllerResult<()>;

    /// Stop idle clocking ahead of an exposure.
    fn stop_idle(&mut self) -> ControllerResult<()>;

    /// Shift the parallel register by `rows` (negative shifts reverse).
    fn parshift(&mut self, rows: i32) -> ControllerResult<()>;

    /// Load readout geometry into the controller.
    fn set_roi(&mut self, geometry: &Geometry) -> ControllerResult<()>;

    fn set_video_gain(&mut self, gain: i32) -> ControllerResult<()>;

    fn set_video_speed(&mut self, speed: i32) -> ControllerResult<()>;

    /// Keywords this controller contributes to every image header.
    fn header(&self) -> Header {
        let mut header = Header::new();
        header.set("CONTROLR", self.controller_type(), "Controller type");
        header
    }
}
