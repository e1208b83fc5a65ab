//! Exposure phase flag shared between the sequencer and command handlers.
//!
//! The sequencer polls the flag at every iteration of its integration loop
//! while command handlers on other threads write abort, pause, resume and
//! read-now requests into it. Stores use `Release` ordering and loads use
//! `Acquire`, so everything a command handler wrote before setting the flag
//! is visible to the poller once it observes the new value.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, FromRepr};

/// Current phase of the exposure in flight.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumString,
    FromRepr,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExposureFlag {
    None = 0,
    Setup = 1,
    Exposing = 2,
    /// Pause requested
    Pause = 3,
    /// Pause confirmed by hardware
    Paused = 4,
    /// Resume requested
    Resume = 5,
    /// Read requested, or integration finished
    Read = 6,
    Readout = 7,
    Writing = 8,
    Abort = 9,
}

impl ExposureFlag {
    /// True while an exposure cycle is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, ExposureFlag::None)
    }
}

/// Atomic cell holding an [`ExposureFlag`].
#[derive(Debug)]
pub struct ExposureFlagCell(AtomicU8);

impl ExposureFlagCell {
    pub fn new(flag: ExposureFlag) -> Self {
        Self(AtomicU8::new(flag as u8))
    }

    pub fn load(&self) -> ExposureFlag {
        ExposureFlag::from_repr(self.0.load(Ordering::Acquire)).unwrap_or(ExposureFlag::None)
    }

    pub fn store(&self, flag: ExposureFlag) {
        self.0.store(flag as u8, Ordering::Release);
    }

    /// Replace `current` with `new`; returns false if the flag had moved on.
    pub fn transition(&self, current: ExposureFlag, new: ExposureFlag) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Store `new` unless the flag is ABORT; returns false if it was.
    pub fn advance(&self, new: ExposureFlag) -> bool {
        let abort = ExposureFlag::Abort as u8;
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != abort).then_some(new as u8)
            })
            .is_ok()
    }
}

impl Default for ExposureFlagCell {
    fn default() -> Self {
        Self::new(ExposureFlag::None)
    }
}

/// Exposure state published for readers that must not block on the sequencer.
///
/// Holds the phase flag plus the last remaining-time reading, the requested
/// exposure time and the pixel countdown, so status verbs can answer while a
/// phase runs.
#[derive(Debug, Default)]
pub struct ExposureControl {
    flag: ExposureFlagCell,
    abort_requested: AtomicBool,
    exposure_time_bits: AtomicU64,
    remaining_bits: AtomicU64,
    pixels_total: AtomicUsize,
    pixels_remaining: AtomicUsize,
}

impl ExposureControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&self) -> ExposureFlag {
        self.flag.load()
    }

    pub fn set_flag(&self, flag: ExposureFlag) {
        self.flag.store(flag);
    }

    /// Conditional flag update, see [`ExposureFlagCell::transition`].
    pub fn transition(&self, current: ExposureFlag, new: ExposureFlag) -> bool {
        self.flag.transition(current, new)
    }

    /// Move to the next phase without losing an abort, see
    /// [`ExposureFlagCell::advance`].
    pub fn advance(&self, new: ExposureFlag) -> bool {
        self.flag.advance(new)
    }

    /// Record an operator abort for loops that check between exposures.
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    /// Read and clear the abort request.
    pub fn take_abort_request(&self) -> bool {
        self.abort_requested.swap(false, Ordering::AcqRel)
    }

    pub fn exposure_time(&self) -> f64 {
        f64::from_bits(self.exposure_time_bits.load(Ordering::Acquire))
    }

    pub fn set_exposure_time(&self, seconds: f64) {
        self.exposure_time_bits.store(seconds.to_bits(), Ordering::Release);
    }

    /// Last integration time remaining reported by the hardware, in seconds.
    pub fn remaining(&self) -> f64 {
        f64::from_bits(self.remaining_bits.load(Ordering::Acquire))
    }

    pub fn set_remaining(&self, seconds: f64) {
        self.remaining_bits.store(seconds.to_bits(), Ordering::Release);
    }

    pub fn pixels_total(&self) -> usize {
        self.pixels_total.load(Ordering::Acquire)
    }

    pub fn pixels_remaining(&self) -> usize {
        self.pixels_remaining.load(Ordering::Acquire)
    }

    /// Start a pixel countdown from `total`.
    pub fn reset_pixels(&self, total: usize) {
        self.pixels_total.store(total, Ordering::Release);
        self.pixels_remaining.store(total, Ordering::Release);
    }

    pub fn set_pixels_remaining(&self, remaining: usize) {
        self.pixels_remaining.store(remaining, Ordering::Release);
    }

    /// Pixels transferred so far in the current readout.
    pub fn pixels_transferred(&self) -> usize {
        self.pixels_total().saturating_sub(self.pixels_remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_flag_roundtrip_and_names() {
        let cell = ExposureFlagCell::default();
        assert_eq!(cell.load(), ExposureFlag::None);
        cell.store(ExposureFlag::Paused);
        assert_eq!(cell.load(), ExposureFlag::Paused);
        assert_eq!(ExposureFlag::Readout.to_string(), "READOUT");
        assert_eq!("abort".parse::<ExposureFlag>().unwrap(), ExposureFlag::Abort);
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let cell = ExposureFlagCell::new(ExposureFlag::Exposing);
        assert!(!cell.transition(ExposureFlag::Paused, ExposureFlag::Resume));
        assert!(cell.transition(ExposureFlag::Exposing, ExposureFlag::Pause));
        assert_eq!(cell.load(), ExposureFlag::Pause);
    }

    #[test]
    fn test_advance_keeps_abort() {
        let cell = ExposureFlagCell::new(ExposureFlag::Exposing);
        assert!(cell.advance(ExposureFlag::Read));
        assert_eq!(cell.load(), ExposureFlag::Read);

        cell.store(ExposureFlag::Abort);
        assert!(!cell.advance(ExposureFlag::Read));
        assert_eq!(cell.load(), ExposureFlag::Abort);
    }

    #[test]
    fn test_flag_visible_across_threads() {
        let control = Arc::new(ExposureControl::new());
        control.set_flag(ExposureFlag::Exposing);

        let writer = Arc::clone(&control);
        let handle = thread::spawn(move || {
            writer.set_remaining(1.0);
            writer.set_flag(ExposureFlag::Abort);
        });
        handle.join().unwrap();

        assert_eq!(control.flag(), ExposureFlag::Abort);
        assert_relative_eq!(control.remaining(), 1.0);
    }

    #[test]
    fn test_abort_request_is_consumed() {
        let control = ExposureControl::new();
        control.request_abort();
        assert!(control.take_abort_request());
        assert!(!control.take_abort_request());
    }

    #[test]
    fn test_pixel_countdown() {
        let control = ExposureControl::new();
        control.reset_pixels(100);
        control.set_pixels_remaining(40);
        assert_eq!(control.pixels_transferred(), 60);
    }
}
