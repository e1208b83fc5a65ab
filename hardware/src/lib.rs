//! Drivers for CCD controller electronics.
//!
//! The exposure sequencer talks to hardware only through the
//! [`CcdController`] and [`TemperatureController`] traits defined here.
//!
//! # Features
//!
//! - `camserver` - ARC controller and temperature readout over the camserver
//!   TCP line protocol
//!
//! The [`sim`] module is always available; demo mode and tests run on it.

pub mod controller;
pub mod sim;
pub mod tempcon;

#[cfg(feature = "camserver")]
pub mod camserver;

pub use controller::{CcdController, ControllerError, ControllerResult, ShutterState};
pub use sim::{SimHandle, SimulatedController};
pub use tempcon::{SimulatedTempCon, TemperatureController, Temperatures};
