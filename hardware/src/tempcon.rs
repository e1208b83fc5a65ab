//! Detector temperature readout.

use serde::{Deserialize, Serialize};
use shared::header::Header;

use crate::controller::ControllerResult;

/// Camera (detector) and dewar temperatures in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    pub camera: f64,
    pub dewar: f64,
}

/// Source of detector temperatures.
///
/// Implementations take `&self` so that status queries can be answered while
/// an exposure holds the controller.
pub trait TemperatureController: Send + Sync {
    /// Disabled controllers contribute nothing to image headers.
    fn is_enabled(&self) -> bool;

    fn temperatures(&self) -> ControllerResult<Temperatures>;

    /// CCDTEMP and DEWTEMP keywords for the current readings.
    fn header(&self) -> ControllerResult<Header> {
        let temps = self.temperatures()?;
        let mut header = Header::new();
        header.set("CCDTEMP", temps.camera, "CCD temperature (C)");
        header.set("DEWTEMP", temps.dewar, "Dewar temperature (C)");
        Ok(header)
    }
}

/// Fixed readings for demo mode.
#[derive(Debug, Clone)]
pub struct SimulatedTempCon {
    pub enabled: bool,
    pub temperatures: Temperatures,
}

impl Default for SimulatedTempCon {
    fn default() -> Self {
        Self {
            enabled: true,
            temperatures: Temperatures {
                camera: -110.0,
                dewar: -180.0,
            },
        }
    }
}

impl TemperatureController for SimulatedTempCon {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn temperatures(&self) -> ControllerResult<Temperatures> {
        Ok(self.temperatures)
    }
}
