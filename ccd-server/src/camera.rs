//! Shared access to the exposure state machine for command handlers.
//!
//! The machine sits behind a mutex that a running phase holds for its whole
//! duration. Abort, pause and resume must still get through, so they go to
//! the atomic [`ExposureControl`] when the machine is busy and straight to
//! the hardware when it is idle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;

use exposure::{
    ExposureControl, ExposureFlag, ExposureResult, ExposureStateMachine, RemoteServerDescriptor,
    SharedDescriptor,
};
use hardware::{ControllerResult, TemperatureController, Temperatures};
use tracing::{error, info};

/// Handle shared by every command connection.
#[derive(Clone)]
pub struct CameraHandle {
    machine: Arc<Mutex<ExposureStateMachine>>,
    control: Arc<ExposureControl>,
    remote: SharedDescriptor,
    tempcon: Option<Arc<dyn TemperatureController>>,
    server_name: String,
}

impl CameraHandle {
    /// Wrap a machine; its control block and delivery target become shared.
    pub fn new(
        machine: ExposureStateMachine,
        tempcon: Option<Arc<dyn TemperatureController>>,
        server_name: &str,
    ) -> Self {
        let control = Arc::clone(machine.control());
        let remote = Arc::clone(machine.remote());
        Self {
            machine: Arc::new(Mutex::new(machine)),
            control,
            remote,
            tempcon,
            server_name: server_name.to_string(),
        }
    }

    pub fn control(&self) -> &ExposureControl {
        &self.control
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Lock the machine, waiting for any running phase to finish.
    pub fn lock(&self) -> MutexGuard<'_, ExposureStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the machine only if no phase is running.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ExposureStateMachine>> {
        match self.machine.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn with_machine<R>(&self, f: impl FnOnce(&mut ExposureStateMachine) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn remote(&self) -> Option<RemoteServerDescriptor> {
        self.remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the remote delivery target; `None` disables delivery.
    pub fn set_remote(&self, descriptor: Option<RemoteServerDescriptor>) {
        match &descriptor {
            Some(d) => info!("Remote image server set to {d}"),
            None => info!("Remote image server disabled"),
        }
        *self.remote.write().unwrap_or_else(PoisonError::into_inner) = descriptor;
    }

    pub fn abort(&self) -> ExposureResult<()> {
        match self.try_lock() {
            Some(mut machine) => machine.abort_idle(),
            None => {
                info!("Abort requested");
                self.control.set_flag(ExposureFlag::Abort);
                self.control.request_abort();
                Ok(())
            }
        }
    }

    pub fn pause(&self) -> ExposureResult<()> {
        match self.try_lock() {
            Some(mut machine) => machine.pause_idle(),
            None => {
                self.control.transition(ExposureFlag::Exposing, ExposureFlag::Pause);
                Ok(())
            }
        }
    }

    pub fn resume(&self) -> ExposureResult<()> {
        match self.try_lock() {
            Some(mut machine) => machine.resume_idle(),
            None => {
                self.control.transition(ExposureFlag::Paused, ExposureFlag::Resume);
                Ok(())
            }
        }
    }

    /// Remaining integration time; the last polled value while a phase runs.
    pub fn exposure_time_remaining(&self) -> ExposureResult<f64> {
        match self.try_lock() {
            Some(mut machine) => machine.exposure_time_remaining(),
            None => Ok(self.control.remaining()),
        }
    }

    pub fn temperatures(&self) -> Option<ControllerResult<Temperatures>> {
        self.tempcon.as_ref().map(|t| t.temperatures())
    }

    /// Run a full exposure on a background thread and return at once.
    pub fn spawn_exposure(&self, duration: f64, image_type: String, title: String) {
        let machine = Arc::clone(&self.machine);
        thread::spawn(move || {
            let mut machine = machine.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = machine.expose(duration, &image_type, &title) {
                error!("Background exposure failed: {e}");
            }
        });
    }
}


#[cfg(test)]
mod tests {
    use super::testing::demo_camera;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_abort_while_idle_goes_to_hardware() {
        let temp_dir = TempDir::new().unwrap();
        let (camera, sim) = demo_camera(temp_dir.path());

        camera.abort().unwrap();

        assert_eq!(sim.count("exposure_abort"), 1);
        assert_eq!(camera.control().flag(), ExposureFlag::None);
    }

    #[test]
    fn test_abort_while_busy_sets_flag_only() {
        let temp_dir = TempDir::new().unwrap();
        let (camera, sim) = demo_camera(temp_dir.path());

        let guard = camera.lock();
        camera.control().set_flag(ExposureFlag::Exposing);
        camera.abort().unwrap();
        drop(guard);

        assert_eq!(sim.count("exposure_abort"), 0);
        assert_eq!(camera.control().flag(), ExposureFlag::Abort);
        assert!(camera.control().take_abort_request());
    }

    #[test]
    fn test_pause_resume_while_busy() {
        let temp_dir = TempDir::new().unwrap();
        let (camera, _sim) = demo_camera(temp_dir.path());

        let _guard = camera.lock();
        camera.control().set_flag(ExposureFlag::Exposing);
        camera.pause().unwrap();
        assert_eq!(camera.control().flag(), ExposureFlag::Pause);

        camera.control().set_flag(ExposureFlag::Paused);
        camera.resume().unwrap();
        assert_eq!(camera.control().flag(), ExposureFlag::Resume);
    }

    #[test]
    fn test_remote_shared_with_machine() {
        let temp_dir = TempDir::new().unwrap();
        let (camera, _sim) = demo_camera(temp_dir.path());
        let descriptor = RemoteServerDescriptor::new("pixel2", 6543, exposure::ServerDialect::Ccdacq);

        camera.set_remote(Some(descriptor.clone()));

        assert_eq!(camera.remote(), Some(descriptor));
        let machine_remote = camera.lock().remote().read().unwrap().clone();
        assert_eq!(machine_remote.map(|d| d.port), Some(6543));
    }
}
