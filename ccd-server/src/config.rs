//! Server configuration and camera assembly.
//!
//! The configuration is a JSON document kept in the shared config store
//! (`~/.cf_config/bluechan_server.json`) unless a file is named on the command
//! line. Every field has a default, so a partial document is enough.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use exposure::{
    ExposureSettings, ExposureStateMachine, Notifiers, RemoteServerDescriptor, ServerDialect,
    StatusFileNotifier,
};
use hardware::camserver::{ArcController, CamServerTempCon, DEFAULT_PORT};
use hardware::{
    CcdController, ControllerError, SimulatedController, SimulatedTempCon, TemperatureController,
};
use serde::{Deserialize, Serialize};
use shared::config_storage::{read_json, ConfigStorage};
use shared::filename::ImageFilename;
use shared::geometry::{DetectorFormat, DetectorParameters, Geometry, GeometryError};
use shared::image_writer::FileImageWriter;
use thiserror::Error;
use tracing::{info, warn};

use crate::camera::CameraHandle;

/// Name of the configuration document in the config store.
pub const CONFIG_DOCUMENT: &str = "bluechan_server";

/// Default command port.
pub const DEFAULT_COMMAND_PORT: u16 = 2402;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("controller unavailable: {0}")]
    Controller(#[from] ControllerError),
}

impl From<GeometryError> for ConfigError {
    fn from(err: GeometryError) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Reported by `get servername`
    pub server_name: String,
    pub image_folder: PathBuf,
    /// File name prefix, followed by the sequence number
    pub image_root: String,
    pub detector: DetectorParameters,
    /// Address of the camserver process driving the controller
    pub camserver: String,
    /// Initial remote image server; `None` disables delivery
    pub remote: Option<RemoteServerDescriptor>,
    pub settings: ExposureSettings,
    /// Status snapshot written after each image
    pub status_file: Option<PathBuf>,
}

/// The Blue Channel STA0520 detector, read through one amplifier.
fn default_detector() -> DetectorParameters {
    let format = DetectorFormat {
        ns_total: 2688,
        ns_predark: 16,
        ns_underscan: 0,
        ns_overscan: 20,
        np_total: 512,
        np_predark: 0,
        np_underscan: 0,
        np_overscan: 0,
        np_frametransfer: 0,
    };
    DetectorParameters {
        name: "STA0520".to_string(),
        description: "Blue Channel spectrograph CCD".to_string(),
        geometry: Geometry::new(format),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_COMMAND_PORT,
            server_name: "bluechan".to_string(),
            image_folder: PathBuf::from("/data/bluechan"),
            image_root: "bc.".to_string(),
            detector: default_detector(),
            camserver: format!("localhost:{DEFAULT_PORT}"),
            remote: Some(RemoteServerDescriptor::new(
                "pixel2",
                6543,
                ServerDialect::Ccdacq,
            )),
            settings: ExposureSettings::default(),
            status_file: None,
        }
    }
}

impl ServerConfig {
    /// Load from `path`, or from the config store when no path is given.
    ///
    /// A detector description saved in the store under the configured name
    /// replaces the inline one.
    pub fn load(storage: &ConfigStorage, path: Option<&Path>) -> ConfigResult<Self> {
        let mut config: ServerConfig = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                read_json(path)?
            }
            None => match storage.get_document(CONFIG_DOCUMENT) {
                Some(result) => result?,
                None => {
                    info!(
                        "No {CONFIG_DOCUMENT} document in {}, using defaults",
                        storage.root_path().display()
                    );
                    ServerConfig::default()
                }
            },
        };

        if let Some(detector) = storage.get_detector(&config.detector.name) {
            config.detector = detector?;
            info!("Using stored detector {}", config.detector.name);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.detector.geometry.validate()?;
        if self.image_root.is_empty() {
            return Err(ConfigError::Invalid("image_root is empty".to_string()));
        }
        Ok(())
    }

    /// Save to the config store, returning the file written.
    pub fn save(&self, storage: &ConfigStorage) -> ConfigResult<PathBuf> {
        Ok(storage.save_document(CONFIG_DOCUMENT, self)?)
    }
}

/// Connect the hardware (or simulators in demo mode) and build the camera.
pub fn build_camera(config: &ServerConfig, demo: bool) -> ConfigResult<CameraHandle> {
    let (controller, tempcon): (Box<dyn CcdController>, Arc<dyn TemperatureController>) = if demo
    {
        info!("Demo mode: using simulated controller");
        (
            Box::new(SimulatedController::new()),
            Arc::new(SimulatedTempCon::default()),
        )
    } else {
        info!("Connecting to camserver at {}", config.camserver);
        (
            Box::new(ArcController::connect(config.camserver.as_str())?),
            Arc::new(CamServerTempCon::connect(config.camserver.as_str())?),
        )
    };

    let mut settings = config.settings.clone();
    settings.demo_mode |= demo;

    let mut notifiers = Notifiers::new();
    if let Some(path) = &config.status_file {
        if !settings.web_update {
            warn!("status_file is set but web_update is off; no snapshots will be written");
        }
        notifiers.add(Box::new(StatusFileNotifier::new(path)));
    }

    let machine = ExposureStateMachine::new(
        controller,
        config.detector.geometry.clone(),
        ImageFilename::new(&config.image_folder, &config.image_root),
        Box::new(FileImageWriter::new()),
    )
    .with_settings(settings)
    .with_remote(Arc::new(RwLock::new(config.remote.clone())))
    .with_tempcon(Arc::clone(&tempcon))
    .with_notifiers(notifiers);

    Ok(CameraHandle::new(machine, Some(tempcon), &config.server_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_store_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(temp_dir.path().to_path_buf());

        let config = ServerConfig::load(&storage, None).unwrap();

        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.port, 2402);
        assert_eq!(config.detector.geometry.image_size().width, 2708);
        assert_eq!(config.remote.as_ref().map(|r| r.dialect), Some(ServerDialect::Ccdacq));
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("server.json");
        std::fs::write(&path, r#"{"port": 3000, "remote": null}"#).unwrap();
        let storage = ConfigStorage::with_path(temp_dir.path().join("store"));

        let config = ServerConfig::load(&storage, Some(&path)).unwrap();

        assert_eq!(config.port, 3000);
        assert!(config.remote.is_none());
        assert_eq!(config.server_name, "bluechan");
        assert!(config.settings.save_file);
    }

    #[test]
    fn test_saved_config_round_trip_through_store() {
        let temp_dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(temp_dir.path().to_path_buf());
        let config = ServerConfig {
            server_name: "testcam".to_string(),
            ..ServerConfig::default()
        };

        config.save(&storage).unwrap();

        let loaded = ServerConfig::load(&storage, None).unwrap();
        assert_eq!(loaded.server_name, "testcam");
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(temp_dir.path().to_path_buf());
        let mut config = ServerConfig::default();
        config.detector.geometry.roi.last_col = 5000;
        config.save(&storage).unwrap();

        assert!(matches!(
            ServerConfig::load(&storage, None),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_build_demo_camera() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig {
            image_folder: temp_dir.path().to_path_buf(),
            ..ServerConfig::default()
        };

        let camera = build_camera(&config, true).unwrap();

        assert_eq!(camera.server_name(), "bluechan");
        assert!(camera.lock().settings().demo_mode);
        assert_eq!(camera.remote().map(|r| r.port), Some(6543));
        assert!(matches!(camera.temperatures(), Some(Ok(_))));
    }
}
