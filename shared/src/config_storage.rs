//! Configuration storage for detector descriptions and server settings.
//!
//! Stores named detector parameter sets and arbitrary JSON configuration
//! documents. All config is stored in ~/.cf_config/ by default.

use crate::geometry::DetectorParameters;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Configuration storage manager.
///
/// Manages loading and saving of configuration files from a centralized
/// directory (defaults to ~/.cf_config/).
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    /// Root directory for all configuration (e.g., ~/.cf_config)
    root_path: PathBuf,
}

fn to_io_error(err: serde_json::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.cf_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join(".cf_config");
        Ok(Self { root_path })
    }

    /// Create a new config storage with custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn detectors_dir(&self) -> PathBuf {
        self.root_path.join("detectors")
    }

    fn detector_filename(&self, name: &str) -> PathBuf {
        // Keep names filesystem safe
        let safe: String = name
            .chars()
            .map(|c| if c == '/' || c == ' ' { '_' } else { c })
            .collect();
        self.detectors_dir().join(format!("{safe}.json"))
    }

    /// Get a detector description by name.
    ///
    /// Returns None if no description exists.
    /// Returns Some(Err) if the file exists but cannot be loaded.
    pub fn get_detector(&self, name: &str) -> Option<std::io::Result<DetectorParameters>> {
        let path = self.detector_filename(name);
        if !path.exists() {
            return None;
        }
        Some(read_json(&path))
    }

    /// Save a detector description, returning the path written.
    pub fn save_detector(&self, detector: &DetectorParameters) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(self.detectors_dir())?;
        let path = self.detector_filename(&detector.name);
        write_json(&path, detector)?;
        Ok(path)
    }

    /// List the names of all stored detector descriptions.
    pub fn list_detectors(&self) -> std::io::Result<Vec<String>> {
        let dir = self.detectors_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a detector description.
    ///
    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn delete_detector(&self, name: &str) -> std::io::Result<bool> {
        let path = self.detector_filename(name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    // =========================================================================
    // Named configuration documents
    // =========================================================================

    fn document_path(&self, name: &str) -> PathBuf {
        self.root_path.join(format!("{name}.json"))
    }

    /// Load a named JSON document such as the server configuration.
    pub fn get_document<T: DeserializeOwned>(&self, name: &str) -> Option<std::io::Result<T>> {
        let path = self.document_path(name);
        if !path.exists() {
            return None;
        }
        Some(read_json(&path))
    }

    /// Save a named JSON document, returning the path written.
    pub fn save_document<T: Serialize>(&self, name: &str, value: &T) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root_path)?;
        let path = self.document_path(name);
        write_json(&path, value)?;
        Ok(path)
    }
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".cf_config")))
    }
}

/// Read a JSON file into `T`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(to_io_error)
}

/// Write `value` as pretty-printed JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let contents = serde_json::to_string_pretty(value).map_err(to_io_error)?;
    std::fs::write(path, contents)
}
