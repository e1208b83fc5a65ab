//! Instrument and telescope capabilities consulted during an exposure.
//!
//! Collaborators are optional and best-effort: a disabled or failing
//! collaborator is logged and skipped, never fatal to the exposure.

use std::time::Duration;

use hardware::ControllerError;
use shared::header::Header;
use thiserror::Error;

/// Failure reported by an instrument, telescope or temperature collaborator.
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("{0} is not available")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),
}

/// Result type for collaborator calls.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Instrument with comparison lamps.
pub trait Instrument: Send {
    fn is_enabled(&self) -> bool;

    /// Select the lamps named by a comp image type.
    fn set_active_comps(&mut self, names: &str) -> CollaboratorResult<()>;

    /// Names of the currently selected lamps.
    fn active_comps(&self) -> CollaboratorResult<Vec<String>>;

    fn comps_on(&mut self) -> CollaboratorResult<()>;

    fn comps_off(&mut self) -> CollaboratorResult<()>;

    /// Lamp warm-up time before integration starts.
    fn comps_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Instruments that strobe lamps with the shutter switch them implicitly.
    fn shutter_strobe(&self) -> bool {
        false
    }

    fn header(&self) -> CollaboratorResult<Header>;
}

/// Telescope providing pointing keywords.
pub trait Telescope: Send {
    fn is_enabled(&self) -> bool;

    fn header(&self) -> CollaboratorResult<Header>;
}
