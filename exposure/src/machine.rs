//! Exposure state machine.
//!
//! One [`ExposureStateMachine`] owns the controller, the pixel buffer and the
//! per-cycle bookkeeping for a single detector. A cycle runs
//! [`begin`](ExposureStateMachine::begin),
//! [`integrate`](ExposureStateMachine::integrate),
//! [`readout`](ExposureStateMachine::readout) and
//! [`end`](ExposureStateMachine::end) in order; [`expose`](ExposureStateMachine::expose)
//! runs all four.
//!
//! Operator commands arrive from other threads through the shared
//! [`ExposureControl`]. The integration loop re-reads the flag at every poll,
//! so abort, pause, resume and read-now take effect at the next poll boundary
//! (at most 0.5 s later).

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hardware::{CcdController, ShutterState, TemperatureController, Temperatures};
use serde::{Deserialize, Serialize};
use shared::filename::{FileType, ImageFilename};
use shared::geometry::{DetectorFormat, FocalPlane, Geometry, Roi};
use shared::header::{Header, KeywordValue};
use shared::image_writer::ImageWriter;
use shared::pixel_buffer::PixelBuffer;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Instrument, Telescope};
use crate::delivery::{OutgoingImage, RemoteDeliveryClient, RemoteServerDescriptor};
use crate::error::{ExposureError, ExposureResult, PhaseOutcome, PhaseResult};
use crate::flag::{ExposureControl, ExposureFlag};
use crate::image_type::ImageType;
use crate::notify::{ExposureEvent, ImageInfo, Notifiers, StatusSnapshot};

/// Longest sleep between remaining-time polls.
const POLL_INTERVAL: f64 = 0.5;

/// Remaining time at or below which integration is considered finished.
const FINISH_THRESHOLD: f64 = 0.1;

/// Consecutive unchanged remaining-time readings tolerated before the
/// timer is declared stuck.
const STUCK_TIMER_POLLS: u32 = 20;

/// Attempts and spacing for sending the exposure time to a busy controller.
const BUSY_RETRIES: u32 = 30;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bounded wait for pixel data in [`ExposureStateMachine::end`].
const VALID_POLLS: u32 = 100;
const VALID_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Settling time after restoring the output drain bias.
const BIAS_SETTLE: Duration = Duration::from_millis(500);

/// Shared, process-wide remote delivery target.
pub type SharedDescriptor = Arc<RwLock<Option<RemoteServerDescriptor>>>;

/// Per-detector switches controlling what a cycle does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureSettings {
    /// Write the image to local disk
    pub save_file: bool,
    /// Send the image to the configured remote server
    pub send_image: bool,
    pub display_image: bool,
    pub analyze_image: bool,
    /// Publish a status snapshot after each image
    pub web_update: bool,
    /// Flush the array before integrating; otherwise only stop idling
    pub flush_array: bool,
    /// Lower the output drain bias while integrating
    pub lower_voltages: bool,
    /// Comp lamps are sequenced externally; only keywords are set
    pub comp_sequence: bool,
    /// Use the image type as the title when none is given
    pub auto_title: bool,
    /// Skip the hardware countdown and synthesise pixel data
    pub demo_mode: bool,
    pub file_type: FileType,
    /// Local file name used for images written only to be sent
    pub temp_image_name: String,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            save_file: true,
            send_image: false,
            display_image: false,
            analyze_image: false,
            web_update: false,
            flush_array: true,
            lower_voltages: false,
            comp_sequence: false,
            auto_title: false,
            demo_mode: false,
            file_type: FileType::Fits,
            temp_image_name: "tempimage".to_string(),
        }
    }
}

/// Truncate to three decimals, as header times and temperatures are reported.
pub fn truncate3(value: f64) -> f64 {
    (value * 1000.0).trunc() / 1000.0
}

/// `HH:MM:SS.ss`; chrono has no two-digit fraction specifier.
fn utc_obs(time: &DateTime<Utc>) -> String {
    // Leap seconds report 1000+ ms
    let centis = time.timestamp_subsec_millis().min(999) / 10;
    format!("{}.{centis:02}", time.format("%H:%M:%S"))
}

/// Sequencer for one detector.
pub struct ExposureStateMachine {
    controller: Box<dyn CcdController>,
    control: Arc<ExposureControl>,
    settings: ExposureSettings,

    geometry: Geometry,
    image: PixelBuffer,
    /// Image header built up over the cycle
    header: Header,
    /// Keywords set by the operator, carried into every image
    user_header: Header,
    filename: ImageFilename,
    writer: Box<dyn ImageWriter>,

    delivery: RemoteDeliveryClient,
    remote: SharedDescriptor,

    instrument: Option<Box<dyn Instrument>>,
    telescope: Option<Box<dyn Telescope>>,
    tempcon: Option<Arc<dyn TemperatureController>>,
    notifiers: Notifiers,

    image_type: ImageType,
    /// Image type used by the immediate-return mode
    immediate_type: ImageType,
    title: String,
    /// Exposure time before a zero forced it to 0
    saved_exposure_time: f64,
    /// Integration actually performed, shorter than requested after a read-now
    actual_exposure_time: f64,
    paused_time: Duration,
    dark_time: f64,
    dark_start: Option<Instant>,
    comp_exposure: bool,
    bias_lowered: bool,
    guide_mode: bool,
    last_image: Option<PathBuf>,
}

impl ExposureStateMachine {
    pub fn new(
        controller: Box<dyn CcdController>,
        geometry: Geometry,
        filename: ImageFilename,
        writer: Box<dyn ImageWriter>,
    ) -> Self {
        let image = PixelBuffer::new(&geometry);
        Self {
            controller,
            control: Arc::new(ExposureControl::new()),
            settings: ExposureSettings::default(),
            geometry,
            image,
            header: Header::new(),
            user_header: Header::new(),
            filename,
            writer,
            delivery: RemoteDeliveryClient::new(),
            remote: Arc::new(RwLock::new(None)),
            instrument: None,
            telescope: None,
            tempcon: None,
            notifiers: Notifiers::new(),
            image_type: ImageType::Object,
            immediate_type: ImageType::Object,
            title: String::new(),
            saved_exposure_time: 0.0,
            actual_exposure_time: 0.0,
            paused_time: Duration::ZERO,
            dark_time: 0.0,
            dark_start: None,
            comp_exposure: false,
            bias_lowered: false,
            guide_mode: false,
            last_image: None,
        }
    }

    pub fn with_settings(mut self, settings: ExposureSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share an existing control block with command handlers.
    pub fn with_control(mut self, control: Arc<ExposureControl>) -> Self {
        self.control = control;
        self
    }

    pub fn with_remote(mut self, remote: SharedDescriptor) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_delivery_client(mut self, client: RemoteDeliveryClient) -> Self {
        self.delivery = client;
        self
    }

    pub fn with_instrument(mut self, instrument: Box<dyn Instrument>) -> Self {
        self.instrument = Some(instrument);
        self
    }

    pub fn with_telescope(mut self, telescope: Box<dyn Telescope>) -> Self {
        self.telescope = Some(telescope);
        self
    }

    pub fn with_tempcon(mut self, tempcon: Arc<dyn TemperatureController>) -> Self {
        self.tempcon = Some(tempcon);
        self
    }

    pub fn with_notifiers(mut self, notifiers: Notifiers) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn control(&self) -> &Arc<ExposureControl> {
        &self.control
    }

    pub fn remote(&self) -> &SharedDescriptor {
        &self.remote
    }

    pub fn settings(&self) -> &ExposureSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut ExposureSettings {
        &mut self.settings
    }

    pub fn filename(&self) -> &ImageFilename {
        &self.filename
    }

    pub fn filename_mut(&mut self) -> &mut ImageFilename {
        &mut self.filename
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn image(&self) -> &PixelBuffer {
        &self.image
    }

    /// Header of the current (or last) image.
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn controller_type(&self) -> &str {
        self.controller.controller_type()
    }

    pub fn image_type(&self) -> &ImageType {
        &self.image_type
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn flag(&self) -> ExposureFlag {
        self.control.flag()
    }

    pub fn actual_exposure_time(&self) -> f64 {
        self.actual_exposure_time
    }

    pub fn dark_time(&self) -> f64 {
        self.dark_time
    }

    pub fn paused_time(&self) -> Duration {
        self.paused_time
    }

    pub fn last_image(&self) -> Option<&PathBuf> {
        self.last_image.as_ref()
    }

    pub fn guide_mode(&self) -> bool {
        self.guide_mode
    }

    /// Guide mode skips video-output selection, shutter control and the
    /// slower header sources.
    pub fn set_guide_mode(&mut self, guide_mode: bool) {
        self.guide_mode = guide_mode;
    }

    /// Readings from the temperature controller, if one is attached.
    pub fn temperatures(&self) -> Option<hardware::ControllerResult<Temperatures>> {
        self.tempcon.as_ref().map(|t| t.temperatures())
    }

    /// Keyword written into every following image.
    pub fn set_keyword(&mut self, name: &str, value: impl Into<KeywordValue>, comment: &str) {
        self.user_header.set(name, value, comment);
    }

    /// Exposure time in seconds, stored and sent to the controller.
    pub fn set_exposure_time(&mut self, seconds: f64) -> ExposureResult<()> {
        if seconds < 0.0 {
            return Err(ExposureError::InvalidArgument(format!(
                "negative exposure time {seconds}"
            )));
        }
        self.control.set_exposure_time(seconds);
        self.saved_exposure_time = seconds;
        self.send_exposure_time(seconds)
    }

    pub fn exposure_time(&self) -> f64 {
        self.control.exposure_time()
    }

    /// Integration time remaining, read from the hardware when a phase is not
    /// already polling it.
    pub fn exposure_time_remaining(&mut self) -> ExposureResult<f64> {
        if self.settings.demo_mode {
            return Ok(self.control.remaining());
        }
        let remaining = self.controller.exposure_time_remaining()?;
        self.control.set_remaining(remaining);
        Ok(remaining)
    }

    pub fn pixels_remaining(&self) -> usize {
        self.control.pixels_remaining()
    }

    /// Pixels read out so far in the current readout.
    pub fn pixels_transferred(&self) -> usize {
        self.control.pixels_transferred()
    }

    /// Reset the controller and return to idle.
    pub fn reset(&mut self) -> ExposureResult<()> {
        self.controller.reset()?;
        self.control.set_flag(ExposureFlag::None);
        info!("Controller reset");
        Ok(())
    }

    /// Clear the array outside an exposure.
    pub fn flush(&mut self) -> ExposureResult<()> {
        self.control.set_flag(ExposureFlag::Setup);
        let result = self.controller.flush();
        self.control.set_flag(ExposureFlag::None);
        result?;
        debug!("Array flushed");
        Ok(())
    }

    pub fn parshift(&mut self, rows: i32) -> ExposureResult<()> {
        self.controller.parshift(rows)?;
        Ok(())
    }

    pub fn set_roi(&mut self, roi: Roi) -> ExposureResult<()> {
        let mut geometry = self.geometry.clone();
        geometry.roi = roi;
        self.set_geometry(geometry)
    }

    /// New readout format; the ROI resets to the full frame.
    pub fn set_format(&mut self, format: DetectorFormat) -> ExposureResult<()> {
        let mut geometry = self.geometry.clone();
        geometry.format = format;
        geometry.roi = Roi::full_frame(&format);
        self.set_geometry(geometry)
    }

    pub fn set_focal_plane(&mut self, focal_plane: FocalPlane) -> ExposureResult<()> {
        let mut geometry = self.geometry.clone();
        geometry.focal_plane = focal_plane;
        self.set_geometry(geometry)
    }

    /// Validate and adopt a geometry; the controller and buffer follow at the
    /// next [`begin`](Self::begin).
    fn set_geometry(&mut self, geometry: Geometry) -> ExposureResult<()> {
        geometry.validate()?;
        info!("Readout geometry now {}", geometry.image_size());
        self.geometry = geometry;
        Ok(())
    }

    pub fn set_gain_speed(&mut self, gain: i32, speed: Option<i32>) -> ExposureResult<()> {
        self.controller.set_video_gain(gain)?;
        if let Some(speed) = speed {
            self.controller.set_video_speed(speed)?;
        }
        Ok(())
    }

    /// Shutter state for the immediate-return mode selects object or dark.
    pub fn set_immediate_shutter(&mut self, state: ShutterState) {
        self.immediate_type = match state {
            ShutterState::Open => ImageType::Object,
            ShutterState::Closed => ImageType::Dark,
        };
    }

    pub fn immediate_type(&self) -> &ImageType {
        &self.immediate_type
    }

    /// Abort issued while no phase is running.
    pub fn abort_idle(&mut self) -> ExposureResult<()> {
        let result = self.controller.exposure_abort();
        self.control.set_flag(ExposureFlag::None);
        result?;
        info!("Exposure aborted");
        Ok(())
    }

    /// Pause issued while no phase is running.
    pub fn pause_idle(&mut self) -> ExposureResult<()> {
        self.controller.exposure_pause()?;
        self.control.transition(ExposureFlag::Exposing, ExposureFlag::Paused);
        Ok(())
    }

    /// Resume issued while no phase is running.
    pub fn resume_idle(&mut self) -> ExposureResult<()> {
        self.controller.exposure_resume()?;
        self.control.transition(ExposureFlag::Paused, ExposureFlag::Exposing);
        Ok(())
    }

    /// Full exposure cycle.
    ///
    /// An abort at any phase is reported as `Ok`; the flag is always back at
    /// NONE when this returns.
    pub fn expose(&mut self, duration: f64, image_type: &str, title: &str) -> ExposureResult<()> {
        if self.control.flag() == ExposureFlag::Abort {
            warn!("Clearing stale abort before exposure");
            self.control.set_flag(ExposureFlag::None);
        }
        if self.control.take_abort_request() {
            debug!("Dropping abort request left by an earlier cycle");
        }

        let result = self.run_cycle(duration, image_type, title);
        self.control.set_flag(ExposureFlag::None);
        match result {
            Ok(PhaseOutcome::Completed) => Ok(()),
            Ok(PhaseOutcome::Aborted(reason)) => {
                info!("Exposure ended early: {reason}");
                Ok(())
            }
            Err(e) => {
                error!("Exposure failed: {e}");
                Err(e)
            }
        }
    }

    /// Begin, integrate, read out and end one exposure, stopping at the first
    /// abort or error.
    pub(crate) fn run_cycle(&mut self, duration: f64, image_type: &str, title: &str) -> PhaseResult {
        let outcome = self.begin(duration, image_type, title)?;
        if outcome.is_aborted() {
            return Ok(outcome);
        }
        if self.control.flag() != ExposureFlag::Abort {
            let outcome = self.integrate()?;
            if outcome.is_aborted() {
                return Ok(outcome);
            }
        }
        if self.control.flag() == ExposureFlag::Read {
            let outcome = self.readout()?;
            if outcome.is_aborted() {
                return Ok(outcome);
            }
        }
        if self.control.flag() == ExposureFlag::Abort {
            return Ok(PhaseOutcome::Aborted("Exposure aborted".to_string()));
        }
        self.end()
    }

    /// Prepare the controller and buffer for an exposure.
    ///
    /// An empty `image_type` or `title`, or a negative `duration`, reuses the
    /// previous value. On error the flag returns to NONE.
    pub fn begin(&mut self, duration: f64, image_type: &str, title: &str) -> PhaseResult {
        let result = self.begin_cycle(duration, image_type, title, true);
        self.settle(result)
    }

    fn begin_cycle(
        &mut self,
        duration: f64,
        image_type: &str,
        title: &str,
        send_time: bool,
    ) -> PhaseResult {
        self.control.set_flag(ExposureFlag::Setup);

        if !self.controller.is_reset() {
            info!("Controller not reset, resetting");
            self.controller.reset()?;
        }

        self.image.reset_flags();
        if !self.image.matches(&self.geometry) {
            self.controller.set_roi(&self.geometry)?;
            self.image = PixelBuffer::new(&self.geometry);
            debug!("Pixel buffer reallocated for {}", self.geometry.image_size());
        }
        self.header.clear();

        if !image_type.is_empty() {
            self.image_type = ImageType::parse(image_type);
        }
        let mut exposure_time = if duration < 0.0 {
            self.saved_exposure_time
        } else {
            duration
        };
        self.saved_exposure_time = exposure_time;
        if self.image_type == ImageType::Zero {
            exposure_time = 0.0;
        }
        self.actual_exposure_time = exposure_time;
        self.paused_time = Duration::ZERO;
        self.dark_start = None;
        self.control.set_exposure_time(exposure_time);
        self.control.set_remaining(exposure_time);

        if !title.is_empty() {
            self.title = title.to_string();
        } else if self.settings.auto_title {
            self.title = self.image_type.name().to_string();
        }
        self.header.set("OBJECT", self.title.as_str(), "Object name");

        if send_time {
            self.send_exposure_time(exposure_time)?;
        }
        self.control.reset_pixels(self.geometry.num_pix_image());

        if !self.guide_mode {
            self.controller.select_video_outputs()?;
            self.controller
                .set_shutter_state(self.image_type.shutter_state())?;
        }

        self.comp_exposure = self.image_type.is_comp();
        self.header.remove("COMPLAMP");
        if self.comp_exposure && self.instrument_enabled() {
            self.setup_comps();
            self.header.set("IMAGETYP", "comp", "Image type");
        } else if !self.guide_mode {
            self.header.set("IMAGETYP", self.image_type.name(), "Image type");
        }

        self.stamp_obs_time();

        if self.settings.flush_array {
            self.controller.flush()?;
        } else {
            self.controller.stop_idle()?;
        }

        if self.control.flag() == ExposureFlag::Abort {
            return Ok(PhaseOutcome::Aborted("Setup aborted".to_string()));
        }
        info!(
            "Exposure set up: {} {:.3} s \"{}\"",
            self.image_type, exposure_time, self.title
        );
        Ok(PhaseOutcome::Completed)
    }

    /// Send the exposure time, retrying while the controller reports busy.
    fn send_exposure_time(&mut self, seconds: f64) -> ExposureResult<()> {
        let mut attempt = 0;
        loop {
            match self.controller.set_exposure_time(seconds) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    debug!("Controller busy setting exposure time, retry {attempt}: {e}");
                    thread::sleep(BUSY_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn instrument_enabled(&self) -> bool {
        self.instrument.as_ref().is_some_and(|i| i.is_enabled())
    }

    /// Select and light the comp lamps; instrument faults are logged only.
    fn setup_comps(&mut self) {
        let Some(instrument) = self.instrument.as_mut() else {
            return;
        };
        let lamps = if self.settings.comp_sequence {
            instrument.active_comps()
        } else {
            let name = self.image_type.name().to_string();
            instrument.set_active_comps(&name).and_then(|()| {
                if !instrument.shutter_strobe() {
                    instrument.comps_on()?;
                }
                thread::sleep(instrument.comps_delay());
                instrument.active_comps()
            })
        };
        match lamps {
            Ok(lamps) => self
                .header
                .set("COMPLAMP", lamps.join(" "), "Comparison lamps"),
            Err(e) => warn!("Comparison lamp setup failed: {e}"),
        }
    }

    fn stamp_obs_time(&mut self) {
        let now = Utc::now();
        self.header.set(
            "DATE-OBS",
            now.format("%Y-%m-%d").to_string(),
            "UTC date at start of exposure",
        );
        self.header
            .set("UTC-OBS", utc_obs(&now), "UTC time at start of exposure");
    }

    /// Integrate, following operator commands until the hardware timer runs
    /// out.
    ///
    /// Ends with the flag at READ, or returns [`PhaseOutcome::Aborted`] with
    /// the flag at ABORT.
    pub fn integrate(&mut self) -> PhaseResult {
        let result = self.integrate_phase();
        self.settle(result)
    }

    /// Errors end the cycle with the flag back at NONE.
    fn settle(&self, result: PhaseResult) -> PhaseResult {
        if result.is_err() {
            self.control.set_flag(ExposureFlag::None);
        }
        result
    }

    fn integrate_phase(&mut self) -> PhaseResult {
        if self.control.flag() == ExposureFlag::Abort {
            return Ok(PhaseOutcome::Aborted("Integration aborted".to_string()));
        }
        if !self.control.advance(ExposureFlag::Exposing) {
            return Ok(PhaseOutcome::Aborted("Integration aborted".to_string()));
        }

        if self.settings.lower_voltages && self.image_type != ImageType::Zero {
            self.controller.set_bias_lowered(true)?;
            self.bias_lowered = true;
        }

        let result = self.count_down();
        if let Err(e) = result {
            self.restore_bias();
            return Err(e);
        }

        if !self.control.advance(ExposureFlag::Read) {
            info!("Exposure aborted");
        }
        if let Some(start) = self.dark_start {
            self.dark_time = start.elapsed().as_secs_f64();
        }

        if self.bias_lowered {
            self.restore_bias();
            thread::sleep(BIAS_SETTLE);
        }

        let aborted = self.control.flag() == ExposureFlag::Abort;
        if self.comp_exposure && self.instrument_enabled() && !self.settings.comp_sequence {
            if let Some(instrument) = self.instrument.as_mut() {
                if let Err(e) = instrument.comps_off() {
                    warn!("Could not turn comparison lamps off: {e}");
                }
            }
            if aborted {
                self.header.remove("COMPLAMP");
            }
        }

        if self.image_type == ImageType::Zero {
            self.control.set_exposure_time(self.saved_exposure_time);
        }

        if aborted {
            return Ok(PhaseOutcome::Aborted("Integration aborted".to_string()));
        }
        info!("Integration finished");
        Ok(PhaseOutcome::Completed)
    }

    /// Start the hardware exposure and poll its timer.
    fn count_down(&mut self) -> ExposureResult<()> {
        self.stamp_obs_time();
        self.dark_start = Some(Instant::now());
        self.controller.start_exposure()?;
        info!("Integration started");

        let exposure_time = self.control.exposure_time();
        let mut remaining = if self.settings.demo_mode {
            0.0
        } else {
            self.poll_remaining()?
        };
        let mut last = remaining;
        let mut unchanged = 0;
        let mut paused_at: Option<Instant> = None;

        while remaining > FINISH_THRESHOLD {
            if self.control.flag() == ExposureFlag::Exposing {
                thread::sleep(Duration::from_secs_f64(remaining.min(POLL_INTERVAL)));
                remaining = self.poll_remaining()?;
                if remaining == last {
                    unchanged += 1;
                } else {
                    unchanged = 0;
                    last = remaining;
                }
            }

            if unchanged > STUCK_TIMER_POLLS {
                error!("Exposure timer stuck at {remaining:.3} s, aborting");
                self.control.set_flag(ExposureFlag::Abort);
            }

            match self.control.flag() {
                ExposureFlag::Abort => {
                    self.controller.exposure_abort()?;
                    break;
                }
                ExposureFlag::Pause => {
                    self.controller.exposure_pause()?;
                    paused_at = Some(Instant::now());
                    // An abort that landed meanwhile is handled on the next pass
                    if self.control.transition(ExposureFlag::Pause, ExposureFlag::Paused) {
                        info!("Exposure paused");
                    }
                }
                ExposureFlag::Resume => {
                    self.controller.exposure_resume()?;
                    if let Some(start) = paused_at.take() {
                        self.paused_time += start.elapsed();
                    }
                    if !self.control.transition(ExposureFlag::Resume, ExposureFlag::Exposing) {
                        continue;
                    }
                    remaining = self.poll_remaining()?;
                    last = remaining;
                    unchanged = 0;
                    info!("Exposure resumed");
                }
                ExposureFlag::Read => {
                    self.actual_exposure_time = (exposure_time - remaining).max(0.0);
                    remaining = 0.0;
                    info!("Early read after {:.3} s", self.actual_exposure_time);
                    break;
                }
                ExposureFlag::Exposing => {}
                _ => thread::sleep(Duration::from_secs_f64(POLL_INTERVAL)),
            }
        }

        if let Some(start) = paused_at {
            self.paused_time += start.elapsed();
        }
        if self.control.flag() != ExposureFlag::Abort && remaining > 0.0 {
            thread::sleep(Duration::from_secs_f64(remaining));
        }
        self.control.set_remaining(0.0);
        Ok(())
    }

    fn poll_remaining(&mut self) -> ExposureResult<f64> {
        let remaining = self.controller.exposure_time_remaining()?;
        self.control.set_remaining(remaining);
        Ok(remaining)
    }

    fn restore_bias(&mut self) {
        if !self.bias_lowered {
            return;
        }
        match self.controller.set_bias_lowered(false) {
            Ok(()) => self.bias_lowered = false,
            Err(e) => warn!("Could not restore output drain bias: {e}"),
        }
    }

    /// Best effort, for error paths that already have a failure to report.
    fn close_shutter(&mut self) {
        if let Err(e) = self.controller.set_shutter_state(ShutterState::Closed) {
            warn!("Could not close shutter: {e}");
        }
    }

    /// Read the detector into the pixel buffer.
    ///
    /// A failed transfer aborts the readout and is reported as
    /// [`PhaseOutcome::Aborted`] with the flag left at ABORT.
    pub fn readout(&mut self) -> PhaseResult {
        let result = self.readout_phase();
        self.settle(result)
    }

    fn readout_phase(&mut self) -> PhaseResult {
        if !self.control.advance(ExposureFlag::Readout) {
            return Ok(PhaseOutcome::Aborted("Readout aborted".to_string()));
        }
        let ramp = self.image_type == ImageType::Ramp;
        if ramp {
            self.controller.set_shutter_state(ShutterState::Open)?;
        }

        if let Err(e) = self.controller.start_readout() {
            if ramp {
                self.close_shutter();
            }
            return Err(e.into());
        }
        info!("Readout started");
        match self.controller.pixels_remaining() {
            Ok(pixels) => self.control.set_pixels_remaining(pixels),
            Err(e) => debug!("Pixel count unavailable: {e}"),
        }

        let transfer = if self.settings.demo_mode {
            self.image.fill_ramp();
            Ok(())
        } else {
            self.receive_pixels()
        };
        self.control.set_pixels_remaining(0);

        if let Err(e) = transfer {
            error!("Image transfer failed: {e}");
            self.control.set_flag(ExposureFlag::Abort);
            if let Err(e) = self.controller.readout_abort() {
                warn!("Readout abort failed: {e}");
            }
        }

        if ramp {
            self.controller.set_shutter_state(ShutterState::Closed)?;
        }

        if !self.control.advance(ExposureFlag::None) {
            return Ok(PhaseOutcome::Aborted("Readout aborted".to_string()));
        }
        info!("Readout finished");
        Ok(PhaseOutcome::Completed)
    }

    fn receive_pixels(&mut self) -> ExposureResult<()> {
        let data = self
            .controller
            .receive_image_data(self.image.transfer_bytes())?;
        self.image.load_interleaved(&data)?;
        Ok(())
    }

    /// Keywords describing the readout geometry.
    fn geometry_header(&self) -> Header {
        let mut header = Header::new();
        let roi = &self.geometry.roi;
        let plane = &self.geometry.focal_plane;
        header.set(
            "CCDSUM",
            format!("{} {}", roi.col_bin, roi.row_bin),
            "On-chip binning",
        );
        header.set(
            "CCDSEC",
            format!(
                "[{}:{},{}:{}]",
                roi.first_col, roi.last_col, roi.first_row, roi.last_row
            ),
            "Region of interest",
        );
        header.set("NAMPS", plane.num_amps() as i64, "Number of amplifiers");
        header.set("NAMPSX", plane.total_amps_x() as i64, "Amplifiers in x");
        header.set("NAMPSY", plane.total_amps_y() as i64, "Amplifiers in y");
        header.set("AMPCONFG", plane.amp_config.as_str(), "Amplifier configuration");
        header
    }

    /// Collect keywords from every source into the image header.
    fn build_header(&mut self) {
        let mut header = self.controller.header();
        header.merge(&self.header);

        if !self.guide_mode {
            header.merge(&self.geometry_header());

            if let Some(instrument) = self.instrument.as_ref().filter(|i| i.is_enabled()) {
                match instrument.header() {
                    Ok(h) => header.merge(&h),
                    Err(e) => warn!("Instrument header unavailable: {e}"),
                }
            }
            if let Some(telescope) = self.telescope.as_ref().filter(|t| t.is_enabled()) {
                match telescope.header() {
                    Ok(h) => header.merge(&h),
                    Err(e) => warn!("Telescope header unavailable: {e}"),
                }
            }
            if let Some(tempcon) = self.tempcon.as_ref().filter(|t| t.is_enabled()) {
                match tempcon.header() {
                    Ok(h) => header.merge(&h),
                    Err(e) => warn!("Temperature header unavailable: {e}"),
                }
            }
        }

        header.merge(&self.user_header);
        self.header = header;
    }

    /// Commit the image: write the file, deliver it and notify consumers.
    ///
    /// The sequence number advances only when a file was written.
    pub fn end(&mut self) -> PhaseResult {
        let result = self.end_phase();
        self.settle(result)
    }

    fn end_phase(&mut self) -> PhaseResult {
        self.control.set_flag(ExposureFlag::Writing);

        if !self.settings.demo_mode
            && !self.image.wait_until_valid(VALID_POLLS, VALID_POLL_INTERVAL)
        {
            error!("Image data not valid after readout");
        }

        self.header.set(
            "EXPTIME",
            truncate3(self.actual_exposure_time),
            "Exposure time (seconds)",
        );
        self.header
            .set("DARKTIME", truncate3(self.dark_time), "Dark time (seconds)");
        self.build_header();

        let file_type = self.settings.file_type;
        let descriptor = if self.settings.send_image {
            self.remote
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        } else {
            None
        };

        let local_path = match &descriptor {
            Some(_) => self.filename.folder.join(format!(
                "{}.{}",
                self.settings.temp_image_name,
                file_type.extension()
            )),
            None => self.filename.path(file_type),
        };
        let remote_name = self.filename.remote_name(file_type);

        let needs_file = descriptor.as_ref().is_some_and(|d| d.dialect.sends_file());
        if self.settings.save_file || needs_file {
            self.writer
                .write(&mut self.image, &self.header, &local_path, file_type)?;
            self.image.mark_written();
            self.filename.increment();
            self.last_image = Some(local_path.clone());
            info!("Image written to {}", local_path.display());
        }

        if let Some(descriptor) = descriptor {
            let file = self.image.is_written().then_some(local_path.as_path());
            let display = self.settings.display_image;
            if let Err(e) = self.delivery.send(
                &descriptor,
                OutgoingImage {
                    image: &mut self.image,
                    file,
                    remote_name: &remote_name,
                    file_type,
                    display,
                },
            ) {
                error!("Could not send image to {descriptor}: {e}");
                return Err(e.into());
            }
        }

        self.image.set_toggle(true);
        self.notify();
        self.control.set_flag(ExposureFlag::None);
        info!("Exposure finished");
        Ok(PhaseOutcome::Completed)
    }

    fn notify(&mut self) {
        let size = self.image.size();
        let info = ImageInfo {
            path: self.image.is_written().then(|| self.last_image.clone()).flatten(),
            width: size.width,
            height: size.height,
            image_type: self.image_type.name().to_string(),
            title: self.title.clone(),
            exposure_time: self.actual_exposure_time,
        };
        if self.settings.display_image {
            self.notifiers.dispatch(&ExposureEvent::Display(info.clone()));
        }
        if self.settings.analyze_image {
            self.notifiers.dispatch(&ExposureEvent::Analyze(info));
        }
        if self.settings.web_update {
            let snapshot = self.status_snapshot();
            self.notifiers.dispatch(&ExposureEvent::Status(snapshot));
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            flag: self.control.flag(),
            exposure_time: self.control.exposure_time(),
            remaining: self.control.remaining(),
            sequence_number: self.filename.sequence_number,
            last_image: self.last_image.clone(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Set up an exposure for the immediate-return mode.
    ///
    /// The exposure time was sent by an earlier `setexposure`, and the image
    /// type follows the last shutter-state request.
    pub fn begin_immediate(&mut self) -> PhaseResult {
        let image_type = self.immediate_type.name().to_string();
        let result = self.begin_cycle(-1.0, &image_type, "", false);
        self.settle(result)
    }

    /// Start integrating and return without polling the timer.
    pub fn integrate_immediate(&mut self) -> ExposureResult<()> {
        self.control.set_flag(ExposureFlag::Exposing);
        self.stamp_obs_time();
        self.dark_start = Some(Instant::now());
        if let Err(e) = self.controller.start_exposure() {
            self.control.set_flag(ExposureFlag::None);
            return Err(e.into());
        }
        info!("Integration started");
        Ok(())
    }

    /// [`begin_immediate`](Self::begin_immediate) followed by
    /// [`integrate_immediate`](Self::integrate_immediate).
    pub fn start_exposure_immediate(&mut self) -> ExposureResult<()> {
        if self.begin_immediate()?.is_aborted() {
            self.control.set_flag(ExposureFlag::None);
            return Ok(());
        }
        self.integrate_immediate()
    }

    /// Read out after an immediate-return exposure.
    ///
    /// A failed transfer leaves the flag at ABORT but is not an error.
    pub fn readout_immediate(&mut self) -> ExposureResult<()> {
        if let Some(start) = self.dark_start {
            self.dark_time = start.elapsed().as_secs_f64();
        }
        self.readout().map(|_| ())
    }

    /// Send the current pixels to `descriptor` outside an exposure cycle.
    pub fn send_current_image(&mut self, descriptor: &RemoteServerDescriptor) -> ExposureResult<()> {
        let remote_name = self.filename.remote_name(self.settings.file_type);
        let file = self.last_image.clone();
        let file = file.as_deref().filter(|_| self.image.is_written());
        self.delivery.send(
            descriptor,
            OutgoingImage {
                image: &mut self.image,
                file,
                remote_name: &remote_name,
                file_type: self.settings.file_type,
                display: false,
            },
        )?;
        Ok(())
    }
}
