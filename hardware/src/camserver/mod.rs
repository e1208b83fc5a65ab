//! Controllers reached through a camserver process over TCP.

mod arc;
mod device;
mod tempcon;

pub use arc::ArcController;
pub use device::{CamServerDevice, DEFAULT_PORT};
pub use tempcon::CamServerTempCon;
