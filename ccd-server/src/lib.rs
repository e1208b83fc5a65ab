//! TCP command server for the exposure sequencer.
//!
//! Clients speak either the MMT ccdacq verbs or the ICE tool commands;
//! [`server::CommandServer`] routes each line to the dialect that accepts it.

pub mod camera;
pub mod config;
pub mod dialect;
pub mod server;

pub use camera::CameraHandle;
pub use config::{build_camera, ConfigError, ConfigResult, ServerConfig};
pub use server::CommandServer;
