//! Temperatures read through a dedicated camserver connection.

use std::net::ToSocketAddrs;
use std::sync::{Mutex, PoisonError};

use super::device::CamServerDevice;
use crate::controller::ControllerResult;
use crate::tempcon::{TemperatureController, Temperatures};

/// Reads the utility board temperatures with `GETTEMPS`.
///
/// Uses its own connection so readings never wait behind a readout.
pub struct CamServerTempCon {
    device: Mutex<CamServerDevice>,
}

impl CamServerTempCon {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> ControllerResult<Self> {
        Ok(Self {
            device: Mutex::new(CamServerDevice::connect(addr)?),
        })
    }
}

impl TemperatureController for CamServerTempCon {
    fn is_enabled(&self) -> bool {
        true
    }

    fn temperatures(&self) -> ControllerResult<Temperatures> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let values = device.query("GETTEMPS")?;
        Ok(Temperatures {
            camera: CamServerDevice::parse_value(&values, 0)?,
            dewar: CamServerDevice::parse_value(&values, 1)?,
        })
    }
}
