//! Best-effort side effects fired when an image is complete.
//!
//! Display, analysis and status publication must never fail an exposure, so
//! they are reached only through [`Notifiers`], which logs and swallows every
//! failure.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::flag::ExposureFlag;

/// Snapshot of a finished image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageInfo {
    /// Local file, if one was written
    pub path: Option<PathBuf>,
    pub width: usize,
    pub height: usize,
    pub image_type: String,
    pub title: String,
    pub exposure_time: f64,
}

/// Exposure state published to status consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub flag: ExposureFlag,
    pub exposure_time: f64,
    pub remaining: f64,
    pub sequence_number: u32,
    pub last_image: Option<PathBuf>,
    pub timestamp: String,
}

/// Events raised at the end of an exposure.
#[derive(Debug, Clone, PartialEq)]
pub enum ExposureEvent {
    Display(ImageInfo),
    Analyze(ImageInfo),
    Status(StatusSnapshot),
}

impl ExposureEvent {
    fn kind(&self) -> &'static str {
        match self {
            ExposureEvent::Display(_) => "display",
            ExposureEvent::Analyze(_) => "analyze",
            ExposureEvent::Status(_) => "status",
        }
    }
}

/// Receiver of exposure events.
pub trait Notifier: Send {
    fn notify(&mut self, event: &ExposureEvent) -> Result<(), String>;
}

/// Fan-out of events to every registered notifier.
#[derive(Default)]
pub struct Notifiers {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, notifier: Box<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Deliver `event` to every notifier, logging failures.
    pub fn dispatch(&mut self, event: &ExposureEvent) {
        debug!("Dispatching {} event", event.kind());
        for notifier in &mut self.notifiers {
            if let Err(e) = notifier.notify(event) {
                warn!("{} notification failed: {}", event.kind(), e);
            }
        }
    }
}

/// Writes each status snapshot to a JSON file for a status web page.
pub struct StatusFileNotifier {
    path: PathBuf,
}

impl StatusFileNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Notifier for StatusFileNotifier {
    fn notify(&mut self, event: &ExposureEvent) -> Result<(), String> {
        let ExposureEvent::Status(snapshot) = event else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(snapshot).map_err(|e| e.to_string())?;
        std::fs::write(&self.path, json)
            .map_err(|e| format!("cannot write {}: {e}", self.path.display()))
    }
}
