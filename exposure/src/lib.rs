//! Exposure sequencing for a CCD camera.
//!
//! [`ExposureStateMachine`] drives a detector through setup, integration,
//! readout and image commit. [`GuideLoopDriver`] repeats that cycle for
//! guiding, and [`RemoteDeliveryClient`] sends finished images to remote
//! image servers. Operator commands reach a running exposure through the
//! atomic [`ExposureControl`] block.

pub mod collaborators;
pub mod delivery;
pub mod error;
pub mod flag;
pub mod guide;
pub mod image_type;
pub mod machine;
pub mod notify;

pub use collaborators::{CollaboratorError, CollaboratorResult, Instrument, Telescope};
pub use delivery::{
    DeliveryError, DeliveryResult, RemoteDeliveryClient, RemoteServerDescriptor, ServerDialect,
};
pub use error::{ExposureError, ExposureResult, PhaseOutcome, PhaseResult};
pub use flag::{ExposureControl, ExposureFlag, ExposureFlagCell};
pub use guide::{GuideLoopDriver, GuideOutcome};
pub use image_type::ImageType;
pub use machine::{truncate3, ExposureSettings, ExposureStateMachine, SharedDescriptor};
pub use notify::{
    ExposureEvent, ImageInfo, Notifier, Notifiers, StatusFileNotifier, StatusSnapshot,
};
