//! Simulated CCD controller.
//!
//! Used in demo mode and by tests. Integration time counts down against the
//! wall clock unless a remaining-time script is loaded, in which case each
//! query pops the next scripted value (the final value repeats once the script
//! runs out). Every command is recorded so tests can assert on the sequence the
//! sequencer issued, and faults can be injected through [`SimHandle`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use shared::geometry::Geometry;
use shared::pixel_buffer::DEMO_RAMP_MODULUS;
use tracing::{debug, trace};

use crate::controller::{CcdController, ControllerError, ControllerResult, ShutterState};

/// Callback invoked with every remaining-time value the simulator reports.
pub type RemainingHook = Box<dyn FnMut(f64) + Send>;

/// Callback invoked with the name of every command as it is issued.
pub type CommandHook = Box<dyn FnMut(&str) + Send>;

#[derive(Default)]
struct SimState {
    commands: Vec<String>,
    is_reset: bool,
    remaining_script: VecDeque<f64>,
    last_scripted: Option<f64>,
    busy_responses: u32,
    fail_transfer: bool,
    failing_command: Option<String>,
    exposure_time: f64,
    started: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
    shutter: Option<ShutterState>,
    bias_lowered: bool,
    geometry: Option<Geometry>,
    gain: i32,
    speed: i32,
    remaining_hook: Option<RemainingHook>,
    command_hook: Option<CommandHook>,
}

impl SimState {
    fn record(&mut self, command: &str) -> ControllerResult<()> {
        trace!("Simulated controller: {command}");
        self.commands.push(command.to_string());
        if let Some(hook) = self.command_hook.as_mut() {
            hook(command);
        }
        if self.failing_command.as_deref() == Some(command) {
            return Err(ControllerError::CommandFailed(format!(
                "{command} rejected by simulator"
            )));
        }
        Ok(())
    }

    fn timed_remaining(&self) -> f64 {
        let Some(started) = self.started else {
            return self.exposure_time;
        };
        let now = self.paused_at.unwrap_or_else(Instant::now);
        let elapsed = now.duration_since(started).saturating_sub(self.paused_total);
        (self.exposure_time - elapsed.as_secs_f64()).max(0.0)
    }
}

/// Inspection and fault-injection handle onto a [`SimulatedController`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every command issued so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Number of times `command` was issued.
    pub fn count(&self, command: &str) -> usize {
        self.lock().commands.iter().filter(|c| *c == command).count()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Report these remaining-time values in order instead of the wall clock.
    pub fn script_remaining(&self, values: impl IntoIterator<Item = f64>) {
        let mut state = self.lock();
        state.remaining_script = values.into_iter().collect();
        state.last_scripted = None;
    }

    /// Answer the next `count` exposure-time commands with a busy error.
    pub fn set_busy_responses(&self, count: u32) {
        self.lock().busy_responses = count;
    }

    pub fn set_transfer_failure(&self, fail: bool) {
        self.lock().fail_transfer = fail;
    }

    /// Make every future issue of `command` fail.
    pub fn fail_command(&self, command: &str) {
        self.lock().failing_command = Some(command.to_string());
    }

    /// Observe each remaining-time reading as it is reported.
    ///
    /// The hook runs with the simulator locked and must not call back into
    /// this handle.
    pub fn set_remaining_hook(&self, hook: impl FnMut(f64) + Send + 'static) {
        self.lock().remaining_hook = Some(Box::new(hook));
    }

    /// Observe each command before the simulator acts on it.
    ///
    /// Same locking rule as [`set_remaining_hook`](Self::set_remaining_hook).
    pub fn set_command_hook(&self, hook: impl FnMut(&str) + Send + 'static) {
        self.lock().command_hook = Some(Box::new(hook));
    }

    pub fn shutter(&self) -> Option<ShutterState> {
        self.lock().shutter
    }

    pub fn bias_lowered(&self) -> bool {
        self.lock().bias_lowered
    }

    pub fn exposure_time(&self) -> f64 {
        self.lock().exposure_time
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.lock().geometry.clone()
    }

    pub fn gain_speed(&self) -> (i32, i32) {
        let state = self.lock();
        (state.gain, state.speed)
    }
}

/// In-process controller with no hardware behind it.
pub struct SimulatedController {
    handle: SimHandle,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self {
            handle: SimHandle {
                state: Arc::new(Mutex::new(SimState::default())),
            },
        }
    }

    /// Handle for inspecting the simulator after it has been boxed.
    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.handle.lock()
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl CcdController for SimulatedController {
    fn controller_type(&self) -> &str {
        "simulator"
    }

    fn reset(&mut self) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record("reset")?;
        state.is_reset = true;
        state.started = None;
        state.paused_at = None;
        debug!("Simulated controller reset");
        Ok(())
    }

    fn is_reset(&self) -> bool {
        self.lock().is_reset
    }

    fn set_exposure_time(&mut self, seconds: f64) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record("set_exposure_time")?;
        if state.busy_responses > 0 {
            state.busy_responses -= 1;
            return Err(ControllerError::Busy("exposure time not accepted".to_string()));
        }
        state.exposure_time = seconds;
        Ok(())
    }

    fn start_exposure(&mut self) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record("start_exposure")?;
        state.started = Some(Instant::now());
        state.paused_at = None;
        state.paused_total = Duration::ZERO;
        Ok(())
    }

    fn exposure_time_remaining(&mut self) -> ControllerResult<f64> {
        let mut state = self.lock();
        state.record("exposure_time_remaining")?;
        let remaining = match state.remaining_script.pop_front() {
            Some(value) => {
                state.last_scripted = Some(value);
                value
            }
            None => match state.last_scripted {
                Some(value) => value,
                None => state.timed_remaining(),
            },
        };
        if let Some(hook) = state.remaining_hook.as_mut() {
            hook(remaining);
        }
        Ok(remaining)
    }

    fn exposure_abort(&mut self) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record("exposure_abort")?;
        state.started = None;
        Ok(())
    }

    fn exposure_pause(&mut self) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record("exposure_pause")?;
        if state.paused_at.is_none() {
            state.paused_at = Some(Instant::now());
        }
        Ok(())
    }

    fn exposure_resume(&mut self) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record("exposure_resume")?;
        if let Some(paused_at) = state.paused_at.take() {
            state.paused_total += paused_at.elapsed();
        }
        Ok(())
    }

    fn start_readout(&mut self) -> ControllerResult<()> {
        self.lock().record("start_readout")
    }

    fn readout_abort(&mut self) -> ControllerResult<()> {
        self.lock().record("readout_abort")
    }

    fn receive_image_data(&mut self, byte_count: usize) -> ControllerResult<Vec<u8>> {
        let mut state = self.lock();
        state.record("receive_image_data")?;
        if state.fail_transfer {
            return Err(ControllerError::Transfer(format!(
                "simulated transfer failure after 0 of {byte_count} bytes"
            )));
        }
        Ok((0..byte_count / 2)
            .flat_map(|i| ((i % DEMO_RAMP_MODULUS) as u16).to_le_bytes())
            .collect())
    }

    fn pixels_remaining(&mut self) -> ControllerResult<usize> {
        Ok(0)
    }

    fn set_shutter_state(&mut self, shutter: ShutterState) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record(&format!("shutter_{shutter}"))?;
        state.shutter = Some(shutter);
        Ok(())
    }

    fn select_video_outputs(&mut self) -> ControllerResult<()> {
        self.lock().record("select_video_outputs")
    }

    fn set_bias_lowered(&mut self, lowered: bool) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record(if lowered { "bias_lower" } else { "bias_restore" })?;
        state.bias_lowered = lowered;
        Ok(())
    }

    fn flush(&mut self) -> ControllerResult<()> {
        self.lock().record("flush")
    }

    fn stop_idle(&mut self) -> ControllerResult<()> {
        self.lock().record("stop_idle")
    }

    fn parshift(&mut self, rows: i32) -> ControllerResult<()> {
        self.lock().record(&format!("parshift_{rows}"))
    }

    fn set_roi(&mut self, geometry: &Geometry) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record("set_roi")?;
        state.geometry = Some(geometry.clone());
        Ok(())
    }

    fn set_video_gain(&mut self, gain: i32) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record("set_video_gain")?;
        state.gain = gain;
        Ok(())
    }

    fn set_video_speed(&mut self, speed: i32) -> ControllerResult<()> {
        let mut state = self.lock();
        state.record("set_video_speed")?;
        state.speed = speed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_scripted_remaining_repeats_last_value() {
        let mut sim = SimulatedController::new();
        sim.handle().script_remaining([1.5, 1.0]);

        assert_relative_eq!(sim.exposure_time_remaining().unwrap(), 1.5);
        assert_relative_eq!(sim.exposure_time_remaining().unwrap(), 1.0);
        assert_relative_eq!(sim.exposure_time_remaining().unwrap(), 1.0);
    }

    #[test]
    fn test_timed_countdown_respects_pause() {
        let mut sim = SimulatedController::new();
        sim.set_exposure_time(10.0).unwrap();
        sim.start_exposure().unwrap();
        sim.exposure_pause().unwrap();
        let paused = sim.exposure_time_remaining().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_relative_eq!(sim.exposure_time_remaining().unwrap(), paused);
        sim.exposure_resume().unwrap();
        assert!(sim.exposure_time_remaining().unwrap() <= paused);
    }

    #[test]
    fn test_busy_then_accept() {
        let mut sim = SimulatedController::new();
        let handle = sim.handle();
        handle.set_busy_responses(2);

        assert!(sim.set_exposure_time(1.0).unwrap_err().is_transient());
        assert!(sim.set_exposure_time(1.0).is_err());
        sim.set_exposure_time(1.0).unwrap();
        assert_eq!(handle.count("set_exposure_time"), 3);
        assert_relative_eq!(handle.exposure_time(), 1.0);
    }

    #[test]
    fn test_transfer_failure_injection() {
        let mut sim = SimulatedController::new();
        sim.handle().set_transfer_failure(true);
        assert!(matches!(
            sim.receive_image_data(16),
            Err(ControllerError::Transfer(_))
        ));
    }

    #[test]
    fn test_failing_command_is_recorded() {
        let mut sim = SimulatedController::new();
        let handle = sim.handle();
        handle.fail_command("flush");
        assert!(sim.flush().is_err());
        assert_eq!(handle.commands(), vec!["flush".to_string()]);
    }

    #[test]
    fn test_command_hook_sees_every_command() {
        let mut sim = SimulatedController::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        sim.handle()
            .set_command_hook(move |command| log.lock().unwrap().push(command.to_string()));

        sim.flush().unwrap();
        sim.exposure_pause().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["flush", "exposure_pause"]);
    }
}
