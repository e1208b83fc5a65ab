//! Continuous guide exposures.

use tracing::{debug, info, warn};

use crate::error::{PhaseOutcome, PhaseResult};
use crate::flag::ExposureFlag;
use crate::machine::ExposureStateMachine;

/// How a guide loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuideOutcome {
    Aborted,
    /// The requested number of cycles ran; `exposures` of them produced an
    /// image.
    Completed { exposures: u32 },
}

/// Repeats guide exposures until aborted or the count is reached.
///
/// Unlike [`ExposureStateMachine::expose`], a failing cycle does not end the
/// loop: the error is logged and the next cycle starts.
#[derive(Debug, Clone, Copy)]
pub struct GuideLoopDriver {
    /// Number of cycles, or -1 to run until aborted
    count: i32,
}

impl GuideLoopDriver {
    pub fn new(count: i32) -> Self {
        Self { count }
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    /// Run with the machine's own abort request as the abort check.
    ///
    /// Requests raised before the loop started belong to an earlier
    /// exposure and are dropped.
    pub fn run(&self, machine: &mut ExposureStateMachine) -> GuideOutcome {
        let control = std::sync::Arc::clone(machine.control());
        if control.take_abort_request() {
            debug!("Dropping abort request left by an earlier exposure");
        }
        self.run_with(machine, || control.take_abort_request())
    }

    /// Run, calling `abort_check` after every cycle.
    pub fn run_with(
        &self,
        machine: &mut ExposureStateMachine,
        mut abort_check: impl FnMut() -> bool,
    ) -> GuideOutcome {
        let previous_mode = machine.guide_mode();
        machine.set_guide_mode(true);
        info!("Guide loop started ({} cycles)", self.count);

        let mut cycles = 0;
        let mut exposures = 0;
        let outcome = loop {
            if self.count >= 0 && cycles >= self.count {
                break GuideOutcome::Completed { exposures };
            }
            cycles += 1;

            match Self::cycle(machine) {
                Ok(PhaseOutcome::Completed) => exposures += 1,
                Ok(PhaseOutcome::Aborted(reason)) => {
                    info!("Guide loop aborted: {reason}");
                    break GuideOutcome::Aborted;
                }
                Err(e) => warn!("Guide exposure {cycles} failed: {e}"),
            }
            machine.control().set_flag(ExposureFlag::None);

            if abort_check() {
                info!("Guide loop aborted");
                break GuideOutcome::Aborted;
            }
        };

        machine.control().set_flag(ExposureFlag::None);
        machine.set_guide_mode(previous_mode);
        info!("Guide loop finished after {cycles} cycles, {exposures} images");
        outcome
    }

    fn cycle(machine: &mut ExposureStateMachine) -> PhaseResult {
        machine.run_cycle(-1.0, "object", "guide image")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hardware::SimulatedController;
    use shared::filename::{FileType, ImageFilename};
    use shared::geometry::{DetectorFormat, Geometry};
    use shared::image_writer::FileImageWriter;
    use tempfile::TempDir;

    fn guide_machine(temp_dir: &TempDir) -> (ExposureStateMachine, hardware::SimHandle) {
        let sim = SimulatedController::new();
        let handle = sim.handle();
        let format = DetectorFormat::from_values([8, 0, 0, 0, 4, 0, 0, 0, 0]).unwrap();
        let mut machine = ExposureStateMachine::new(
            Box::new(sim),
            Geometry::new(format),
            ImageFilename::new(temp_dir.path(), "guide."),
            Box::new(FileImageWriter::new()),
        );
        machine.settings_mut().file_type = FileType::Binary;
        machine.settings_mut().demo_mode = true;
        (machine, handle)
    }

    #[test]
    fn test_runs_requested_count() {
        let temp_dir = TempDir::new().unwrap();
        let (mut machine, handle) = guide_machine(&temp_dir);

        let outcome = GuideLoopDriver::new(3).run(&mut machine);
        assert_eq!(outcome, GuideOutcome::Completed { exposures: 3 });
        assert_eq!(machine.filename().sequence_number, 4);
        assert!(!machine.guide_mode());
        // Guide mode leaves the shutter and video outputs alone
        assert_eq!(handle.shutter(), None);
        assert_eq!(handle.count("select_video_outputs"), 0);
    }

    #[test]
    fn test_failed_cycles_do_not_stop_loop() {
        let temp_dir = TempDir::new().unwrap();
        let (mut machine, handle) = guide_machine(&temp_dir);
        handle.fail_command("flush");

        let outcome = GuideLoopDriver::new(3).run(&mut machine);
        assert_eq!(outcome, GuideOutcome::Completed { exposures: 0 });
        assert_eq!(handle.count("flush"), 3);
        assert_eq!(machine.flag(), ExposureFlag::None);
    }

    #[test]
    fn test_abort_check_ends_unbounded_loop() {
        let temp_dir = TempDir::new().unwrap();
        let (mut machine, _handle) = guide_machine(&temp_dir);

        let mut checks = 0;
        let outcome = GuideLoopDriver::new(-1).run_with(&mut machine, || {
            checks += 1;
            checks == 2
        });
        assert_eq!(outcome, GuideOutcome::Aborted);
        assert_eq!(machine.filename().sequence_number, 3);
    }

    #[test]
    fn test_abort_request_during_cycle_ends_loop() {
        let temp_dir = TempDir::new().unwrap();
        let (mut machine, handle) = guide_machine(&temp_dir);
        let control = std::sync::Arc::clone(machine.control());
        handle.set_command_hook(move |command| {
            if command == "start_readout" {
                control.request_abort();
            }
        });

        assert_eq!(GuideLoopDriver::new(-1).run(&mut machine), GuideOutcome::Aborted);
        assert_eq!(handle.count("start_exposure"), 1);
        assert!(!machine.control().take_abort_request());
    }

    #[test]
    fn test_earlier_abort_request_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let (mut machine, handle) = guide_machine(&temp_dir);
        machine.control().request_abort();

        let outcome = GuideLoopDriver::new(3).run(&mut machine);
        assert_eq!(outcome, GuideOutcome::Completed { exposures: 3 });
        assert_eq!(handle.count("start_exposure"), 3);
    }
}
