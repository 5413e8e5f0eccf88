//! Capture session state machine.
//!
//! One logical thread drives everything: the front-end calls the control
//! methods and invokes [`CaptureSession::on_tick`] once per
//! [`CaptureSession::tick_period`]. Nothing here blocks except the device's
//! `get_frame`, and a stalled frame only delays the tick.

use std::time::Duration;

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DeviceConfig, SessionConfig};
use crate::exposure::{initial_ceiling, ExposureEstimator, ExposureTuning, StepOutcome};
use crate::registry;
use crate::sink::{FrameSink, SaveFormat};
use crate::traits::{
    BackendKind, CaptureDevice, DeviceError, DisplayFrame, ExposureRange, Result as DeviceResult,
};

/// Slowest allowed frame rate.
pub const MIN_FPS: f64 = 1.0;
/// Fastest allowed frame rate.
pub const MAX_FPS: f64 = 100.0;

const SUBFOLDER_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Builds a closed device for a backend.
pub type DeviceFactory = Box<dyn FnMut(BackendKind) -> DeviceResult<Box<dyn CaptureDevice>>>;

/// Errors returned by session control calls.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Device construction, open or property failure.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Call requires a running session.
    #[error("Session is not running")]
    NotRunning,
    /// Call requires a stopped session.
    #[error("Session is already running")]
    AlreadyRunning,
    /// Call is not allowed while paused.
    #[error("Session is paused")]
    Paused,
    /// Call is not allowed while recording.
    #[error("Recording in progress")]
    RecordingActive,
    /// An exposure estimation run is already in progress.
    #[error("Exposure estimation already running")]
    AlreadyEstimating,
    /// Frame rate is not a positive finite number.
    #[error("Invalid frame rate: {0}")]
    InvalidFps(f64),
}

/// Result type for session control calls.
pub type Result<T> = std::result::Result<T, SessionError>;

/// State read by the front-end for rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Published {
    /// Last display frame.
    pub display: Option<DisplayFrame>,
    /// Device exposure in microseconds.
    pub exposure: u32,
    /// Device exposure limits.
    pub exposure_range: Option<ExposureRange>,
    /// Device bit depth.
    pub bit_depth: u8,
    /// Recording flag.
    pub recording: bool,
    /// Exposure estimation flag.
    pub estimating_exposure: bool,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Stopped or paused; nothing happened.
    Idle,
    /// The device delivered no frame.
    Missed,
    /// A frame was published.
    Frame {
        /// Whether the frame was handed to the sink successfully.
        saved: bool,
    },
}

/// Orchestrates one device: lifecycle, per-tick acquisition, recording and
/// auto-exposure.
pub struct CaptureSession {
    backend: BackendKind,
    factory: DeviceFactory,
    device: Option<Box<dyn CaptureDevice>>,
    sink: Box<dyn FrameSink>,
    running: bool,
    paused: bool,
    recording: bool,
    estimator: ExposureEstimator,
    fps: f64,
    frame_counter: u32,
    recording_format: SaveFormat,
    filename_stem: String,
    published: Published,
}

impl CaptureSession {
    /// Session constructing devices through the registry.
    pub fn new(config: &Config, sink: Box<dyn FrameSink>) -> Result<Self> {
        let device: DeviceConfig = config.device.clone();
        let tuning: ExposureTuning = config.exposure.tuning();
        let factory: DeviceFactory =
            Box::new(move |kind| registry::construct(kind, &device, tuning));
        Self::with_factory(&config.session, config.exposure.max_tries, factory, sink)
    }

    /// Session constructing devices through `factory`.
    pub fn with_factory(
        session: &SessionConfig,
        max_tries: u32,
        factory: DeviceFactory,
        sink: Box<dyn FrameSink>,
    ) -> Result<Self> {
        let fps = checked_fps(session.fps)?;
        Ok(Self {
            backend: session.backend,
            factory,
            device: None,
            sink,
            running: false,
            paused: false,
            recording: false,
            estimator: ExposureEstimator::new(max_tries),
            fps,
            frame_counter: 0,
            recording_format: session.recording_format,
            filename_stem: session.filename_stem.clone(),
            published: Published::default(),
        })
    }

    /// Stopped → Running. On failure the session stays stopped.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(SessionError::AlreadyRunning);
        }

        let mut device = (self.factory)(self.backend)?;
        if let Err(err) = device.open() {
            error!(backend = %self.backend, error = %err, "failed to open device");
            return Err(err.into());
        }

        let range = device.exposure_range();
        let (low, high) = exposure_window(range, self.fps);
        let exposure = device.exposure();
        if exposure < low || exposure > high {
            let target = range.snap_down(exposure.clamp(low, high));
            match device.set_exposure(target) {
                Ok(true) => debug!(from = exposure, to = target, "exposure clamped into window"),
                Ok(false) => debug!(target, "device rejected clamped exposure"),
                Err(err) => warn!(error = %err, "failed to clamp exposure"),
            }
        }

        self.published = Published {
            display: None,
            exposure: device.exposure(),
            exposure_range: Some(range),
            bit_depth: device.bit_depth(),
            recording: false,
            estimating_exposure: false,
        };
        self.device = Some(device);
        self.running = true;
        self.paused = false;
        self.recording = false;
        info!(backend = %self.backend, fps = self.fps, "session started");
        Ok(())
    }

    /// Running → Stopped. Recording and estimation are cancelled.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Err(SessionError::NotRunning);
        }
        if let Some(mut device) = self.device.take() {
            self.estimator.cancel(device.as_mut());
            if let Err(err) = device.close() {
                warn!(error = %err, "failed to close device");
            }
        }
        self.running = false;
        self.paused = false;
        self.recording = false;
        self.published.recording = false;
        self.published.estimating_exposure = false;
        info!(backend = %self.backend, "session stopped");
        Ok(())
    }

    /// Suspend per-tick work without closing the device.
    pub fn pause(&mut self) -> Result<()> {
        self.require_running()?;
        self.paused = true;
        Ok(())
    }

    /// Resume per-tick work.
    pub fn resume(&mut self) -> Result<()> {
        self.require_running()?;
        self.paused = false;
        Ok(())
    }

    /// One scheduling period: optional estimator step, frame pull, optional
    /// save, publish.
    pub fn on_tick(&mut self) -> TickOutcome {
        if !self.running || self.paused {
            return TickOutcome::Idle;
        }
        let Some(device) = self.device.as_mut() else {
            return TickOutcome::Idle;
        };

        self.estimator.before_frame(device.as_mut());

        let frame = match device.get_frame(self.fps) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(error = %err, backend = ?err.backend(), "no frame this tick");
                None
            }
        };

        let mut saved = false;
        let raw = frame.map(|(raw, display)| {
            self.published.display = Some(display);
            raw
        });

        if let Some(raw) = raw.as_ref().filter(|_| self.recording) {
            let stem = format!("{}_{:04}", self.filename_stem, self.frame_counter);
            let folder = device.save_folder();
            let header = device.metadata_header();
            match self
                .sink
                .save(raw, &folder, &stem, &header, self.recording_format)
            {
                Ok(()) => {
                    self.frame_counter += 1;
                    saved = true;
                }
                Err(err) => error!(error = %err, stem = %stem, "failed to save frame"),
            }
        }

        let outcome = self.estimator.after_frame(device.as_mut(), raw.as_ref());
        if outcome != StepOutcome::Idle {
            self.published.exposure = device.exposure();
            self.published.estimating_exposure = self.estimator.is_searching();
        }

        if raw.is_some() {
            TickOutcome::Frame { saved }
        } else {
            TickOutcome::Missed
        }
    }

    /// Start or stop recording. Starting resets the frame counter and moves
    /// the device into a fresh timestamped subfolder.
    pub fn toggle_recording(&mut self) -> Result<bool> {
        self.require_active()?;
        if self.recording {
            self.recording = false;
            info!(frames = self.frame_counter, "recording stopped");
        } else {
            let subfolder = Local::now().format(SUBFOLDER_FORMAT).to_string();
            if let Some(device) = self.device.as_mut() {
                device.set_save_subfolder(&subfolder)?;
            }
            self.frame_counter = 0;
            self.recording = true;
            info!(subfolder = %subfolder, format = %self.recording_format, "recording started");
        }
        self.published.recording = self.recording;
        Ok(self.recording)
    }

    /// Start an exposure estimation run at the current target fps.
    pub fn toggle_exposure_estimation(&mut self) -> Result<()> {
        self.require_active()?;
        if self.estimator.is_searching() {
            return Err(SessionError::AlreadyEstimating);
        }
        if let Some(device) = self.device.as_mut() {
            self.estimator.begin(device.as_mut(), self.fps);
        }
        self.published.estimating_exposure = true;
        Ok(())
    }

    /// Set the target frame rate, clamped to [`MIN_FPS`]..=[`MAX_FPS`].
    /// Returns the applied value.
    pub fn set_fps(&mut self, fps: f64) -> Result<f64> {
        self.fps = checked_fps(fps)?;
        debug!(fps = self.fps, "frame rate set");
        Ok(self.fps)
    }

    /// Interval between two ticks.
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }

    /// Clamp `exposure` into the current window, snap it down to the device
    /// step and apply it. Returns the exposure the device actually reports.
    pub fn set_exposure(&mut self, exposure: u32) -> Result<u32> {
        self.require_active()?;
        let fps = self.fps;
        let Some(device) = self.device.as_mut() else {
            return Err(SessionError::NotRunning);
        };

        let range = device.exposure_range();
        if exposure == 0 {
            return Err(DeviceError::InvalidExposure {
                value: exposure,
                min: range.min,
                max: range.max,
            }
            .into());
        }

        let (low, high) = exposure_window(range, fps);
        let target = range.snap_down(exposure.clamp(low, high));
        match device.set_exposure(target) {
            Ok(true) => debug!(target, "exposure set"),
            Ok(false) => debug!(target, "device rejected exposure"),
            Err(err) => warn!(error = %err, target, "failed to set exposure"),
        }
        // device is the source of truth, whatever happened above
        self.published.exposure = device.exposure();
        Ok(self.published.exposure)
    }

    /// Flip the device bit depth. Not allowed while recording.
    pub fn toggle_bit_depth(&mut self) -> Result<u8> {
        self.require_active()?;
        if self.recording {
            return Err(SessionError::RecordingActive);
        }
        if let Some(device) = self.device.as_mut() {
            device.toggle_bit_depth();
            self.published.bit_depth = device.bit_depth();
        }
        Ok(self.published.bit_depth)
    }

    /// Flip the device's display rendering.
    pub fn toggle_view(&mut self) -> Result<()> {
        self.require_active()?;
        if let Some(device) = self.device.as_mut() {
            device.toggle_view();
        }
        Ok(())
    }

    /// Choose the backend used by the next `start`.
    pub fn select_backend(&mut self, backend: BackendKind) -> Result<()> {
        if self.running {
            return Err(SessionError::AlreadyRunning);
        }
        self.backend = backend;
        Ok(())
    }

    /// Format for subsequent recordings. Locked while recording.
    pub fn set_recording_format(&mut self, format: SaveFormat) -> Result<()> {
        if self.recording {
            return Err(SessionError::RecordingActive);
        }
        self.recording_format = format;
        Ok(())
    }

    /// Filename stem for subsequent recordings. Locked while recording.
    pub fn set_filename_stem(&mut self, stem: &str) -> Result<()> {
        if self.recording {
            return Err(SessionError::RecordingActive);
        }
        stem.clone_into(&mut self.filename_stem);
        Ok(())
    }

    /// Published state for rendering.
    #[must_use]
    pub const fn published(&self) -> &Published {
        &self.published
    }

    /// Active device, while running.
    #[must_use]
    pub fn device(&self) -> Option<&dyn CaptureDevice> {
        self.device.as_deref()
    }

    /// Selected backend.
    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Whether the session is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the session is paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether frames are being recorded.
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    /// Whether an exposure estimation run is in progress.
    #[must_use]
    pub const fn is_estimating_exposure(&self) -> bool {
        self.estimator.is_searching()
    }

    /// Frames saved in the current recording run.
    #[must_use]
    pub const fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    /// Target frame rate.
    #[must_use]
    pub const fn fps(&self) -> f64 {
        self.fps
    }

    /// Format handed to the sink.
    #[must_use]
    pub const fn recording_format(&self) -> SaveFormat {
        self.recording_format
    }

    /// Filename stem handed to the sink.
    #[must_use]
    pub fn filename_stem(&self) -> &str {
        &self.filename_stem
    }

    const fn require_running(&self) -> Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(SessionError::NotRunning)
        }
    }

    const fn require_active(&self) -> Result<()> {
        if !self.running {
            Err(SessionError::NotRunning)
        } else if self.paused {
            Err(SessionError::Paused)
        } else {
            Ok(())
        }
    }
}

fn checked_fps(fps: f64) -> Result<f64> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(SessionError::InvalidFps(fps));
    }
    Ok(fps.clamp(MIN_FPS, MAX_FPS))
}

/// Exposures the session will request: strictly inside the device range and
/// no longer than one frame period.
fn exposure_window(range: ExposureRange, fps: f64) -> (u32, u32) {
    let step = range.step.max(1);
    let low = range.min.saturating_add(step);
    let high = initial_ceiling(range.max.saturating_sub(step), fps).max(low);
    (low, high)
}
