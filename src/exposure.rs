//! Binary-search automatic exposure.
//!
//! [`ExposureSearch`] is the per-device search interval that backends own and
//! narrow in `check_exposure`. [`ExposureEstimator`] is the session-side
//! controller that drives a device through one search run and guarantees
//! termination after a fixed number of ticks.

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::traits::{CaptureDevice, RawFrame};

/// Ticks after which a search run is abandoned.
pub const DEFAULT_MAX_TRIES: u32 = 50;

/// Saturation target for one bit depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SaturationPolicy {
    /// Saturated samples tolerated before exposure is reduced.
    pub allowed_saturation: u64,
    /// Converged when the saturated count is this close to the target.
    pub tolerance: u64,
}

impl SaturationPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(allowed_saturation: u64, tolerance: u64) -> Self {
        Self {
            allowed_saturation,
            tolerance,
        }
    }
}

/// Backend-supplied convergence thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureTuning {
    /// Policy for bit depths up to 8.
    pub eight_bit: SaturationPolicy,
    /// Policy for deeper bit depths.
    pub sixteen_bit: SaturationPolicy,
    /// Converged once the interval is narrower than this (native units).
    pub min_interval: u32,
    /// Converged once successive midpoints are within this many steps.
    pub step_window: u32,
}

impl Default for ExposureTuning {
    fn default() -> Self {
        Self {
            eight_bit: SaturationPolicy::new(8000, 1000),
            sixteen_bit: SaturationPolicy::new(100, 20),
            min_interval: 10,
            step_window: 2,
        }
    }
}

impl ExposureTuning {
    /// Policy applicable to `bit_depth`.
    #[must_use]
    pub const fn policy(&self, bit_depth: u8) -> SaturationPolicy {
        if bit_depth > 8 {
            self.sixteen_bit
        } else {
            self.eight_bit
        }
    }
}

/// Search interval for one auto-exposure run, in the backend's native unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureSearch {
    floor: u32,
    ceiling: u32,
    step: u32,
    min: u32,
    max: u32,
    current: u32,
    tuning: ExposureTuning,
}

impl ExposureSearch {
    /// Search over `[floor, ceiling]` with the given increment.
    #[must_use]
    pub const fn new(floor: u32, ceiling: u32, step: u32, tuning: ExposureTuning) -> Self {
        Self {
            floor,
            ceiling,
            step,
            min: floor,
            max: ceiling,
            current: floor,
            tuning,
        }
    }

    /// Start a run: `max` becomes `min(max_hint, ceiling)`, `min` the floor.
    pub fn init(&mut self, max_hint: u32) {
        self.max = max_hint.min(self.ceiling);
        self.min = self.floor;
    }

    /// Move to the interval midpoint and return it.
    pub fn adjust(&mut self) -> u32 {
        self.current = self.midpoint();
        self.current
    }

    /// Record an exposure applied outside the search.
    pub fn set_current(&mut self, value: u32) {
        self.current = value;
    }

    /// Narrow the interval given the saturated-sample count of a frame taken
    /// at `current`, and report convergence.
    pub fn check(&mut self, saturated: u64, bit_depth: u8) -> bool {
        let policy = self.tuning.policy(bit_depth);
        if saturated > policy.allowed_saturation {
            self.max = self.current.saturating_sub(1);
        } else {
            self.min = self.current.saturating_add(1);
        }

        let width = i64::from(self.max) - i64::from(self.min);
        let next = self.midpoint();
        let drift = self.current.abs_diff(next);

        debug!(
            saturated,
            min = self.min,
            max = self.max,
            current = self.current,
            "exposure search step"
        );

        saturated.abs_diff(policy.allowed_saturation) < policy.tolerance
            || width.abs() < i64::from(self.tuning.min_interval)
            || drift <= self.tuning.step_window.saturating_mul(self.step)
    }

    /// Restore the interval to the absolute bounds.
    pub fn reset(&mut self) {
        self.min = self.floor;
        self.max = self.ceiling;
    }

    /// Replace the absolute bounds (e.g. after a device reports its limits).
    pub fn rebound(&mut self, floor: u32, ceiling: u32, step: u32) {
        self.floor = floor;
        self.ceiling = ceiling;
        self.step = step;
        self.reset();
    }

    /// `(min, max)` of the current interval.
    #[must_use]
    pub const fn bounds(&self) -> (u32, u32) {
        (self.min, self.max)
    }

    /// Last probed exposure.
    #[must_use]
    pub const fn current(&self) -> u32 {
        self.current
    }

    /// `⌊(min + max) / 2⌋`.
    #[must_use]
    pub const fn midpoint(&self) -> u32 {
        let sum = self.min as u64 + self.max as u64;
        #[allow(clippy::cast_possible_truncation)]
        let mid = (sum / 2) as u32;
        mid
    }
}

/// Initial ceiling for a run: never longer than one frame period.
#[must_use]
pub fn initial_ceiling(absolute_max: u32, target_fps: f64) -> u32 {
    if target_fps <= 0.0 || !target_fps.is_finite() {
        return absolute_max;
    }
    let frame_period = (1_000_000.0 / target_fps).floor();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let frame_period = frame_period.min(f64::from(u32::MAX)) as u32;
    absolute_max.min(frame_period)
}

/// Result of feeding one tick to the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Not searching.
    Idle,
    /// Still searching.
    Continue,
    /// The device reported convergence.
    Converged {
        /// Ticks spent.
        tries: u32,
    },
    /// The iteration ceiling was hit.
    GaveUp {
        /// Ticks spent.
        tries: u32,
    },
}

impl StepOutcome {
    /// Whether this outcome ended the run.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Converged { .. } | Self::GaveUp { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Searching { tries: u32 },
}

/// Two-state auto-exposure controller.
#[derive(Debug, Clone)]
pub struct ExposureEstimator {
    state: State,
    max_tries: u32,
}

impl Default for ExposureEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRIES)
    }
}

impl ExposureEstimator {
    /// Estimator giving up after `max_tries` ticks.
    #[must_use]
    pub const fn new(max_tries: u32) -> Self {
        Self {
            state: State::Idle,
            max_tries,
        }
    }

    /// Whether a run is in progress.
    #[must_use]
    pub const fn is_searching(&self) -> bool {
        matches!(self.state, State::Searching { .. })
    }

    /// Ticks spent in the current run (0 when idle).
    #[must_use]
    pub const fn tries(&self) -> u32 {
        match self.state {
            State::Idle => 0,
            State::Searching { tries } => tries,
        }
    }

    /// Idle → Searching. Seeds the device interval from the frame period.
    pub fn begin(&mut self, device: &mut dyn CaptureDevice, target_fps: f64) {
        let ceiling = initial_ceiling(device.exposure_range().max, target_fps);
        device.init_exposure(ceiling);
        self.state = State::Searching { tries: 0 };
        info!(ceiling, target_fps, "exposure estimation started");
    }

    /// First half of a tick: move the device to the interval midpoint.
    pub fn before_frame(&mut self, device: &mut dyn CaptureDevice) {
        if !self.is_searching() {
            return;
        }
        if let Err(err) = device.adjust_exposure() {
            warn!(error = %err, "failed to adjust exposure");
        }
    }

    /// Second half of a tick: check the frame (if one arrived) and count the
    /// try. Convergence or the iteration ceiling returns to Idle.
    pub fn after_frame(
        &mut self,
        device: &mut dyn CaptureDevice,
        frame: Option<&RawFrame>,
    ) -> StepOutcome {
        let State::Searching { tries } = self.state else {
            return StepOutcome::Idle;
        };

        let converged = frame.is_some_and(|frame| device.check_exposure(frame));
        let tries = tries + 1;

        let outcome = if converged {
            StepOutcome::Converged { tries }
        } else if tries >= self.max_tries {
            StepOutcome::GaveUp { tries }
        } else {
            StepOutcome::Continue
        };

        if outcome.is_finished() {
            device.reset_exposure_search();
            self.state = State::Idle;
            info!(
                exposure = device.exposure(),
                tries,
                converged,
                "exposure estimation finished"
            );
        } else {
            self.state = State::Searching { tries };
        }
        outcome
    }

    /// Abandon the run without waiting for convergence.
    pub fn cancel(&mut self, device: &mut dyn CaptureDevice) {
        if self.is_searching() {
            device.reset_exposure_search();
            self.state = State::Idle;
            info!("exposure estimation cancelled");
        }
    }
}
