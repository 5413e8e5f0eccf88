//! Simulated camera for running and testing without hardware.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::debug;

use crate::exposure::{ExposureSearch, ExposureTuning};
use crate::sink::SaveLocation;
use crate::traits::{
    dynamic_range, BackendKind, CaptureDevice, DeviceError, DisplayFrame, ExposureRange,
    MetadataHeader, RawFrame, Result, Samples, ViewMode,
};

const MOCK_HEIGHT: u32 = 480;
const MOCK_WIDTH: u32 = 640;
const MOCK_DEFAULT_EXPOSURE_US: u32 = 10_000;
const MOCK_EXPOSURE_RANGE: ExposureRange = ExposureRange::new(100, 500_000, 20);
const BAR_WIDTH: u32 = 5;

/// Exposure at which the rightmost column of the ramp reaches full scale.
pub const RAMP_FULL_SCALE_EXPOSURE_US: u64 = 20_000;

/// Test pattern types for simulated frame generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TestPattern {
    /// Exposure-proportional horizontal ramp with a moving bar on top.
    MovingBar,
    /// Exposure-proportional horizontal ramp only.
    Ramp,
    /// Every sample at a fixed fraction of full scale, independent of exposure.
    Solid(f32),
}

/// Simulated camera.
#[derive(Debug)]
pub struct MockCamera {
    shape: (u32, u32),
    bit_depth: u8,
    exposure: u32,
    search: ExposureSearch,
    view: ViewMode,
    pattern: TestPattern,
    frame_count: u64,
    dropped_frames: BTreeSet<u64>,
    open: bool,
    save: SaveLocation,
}

impl MockCamera {
    /// Create a simulated camera saving under `save_root`.
    pub fn new(save_root: PathBuf, tuning: ExposureTuning) -> Result<Self> {
        let range = MOCK_EXPOSURE_RANGE;
        Ok(Self {
            shape: (MOCK_HEIGHT, MOCK_WIDTH),
            bit_depth: 8,
            exposure: MOCK_DEFAULT_EXPOSURE_US,
            search: ExposureSearch::new(range.min, range.max, range.step, tuning),
            view: ViewMode::Raw,
            pattern: TestPattern::MovingBar,
            frame_count: 0,
            dropped_frames: BTreeSet::new(),
            open: false,
            save: SaveLocation::new(save_root)?,
        })
    }

    /// Set the frame shape `(height, width)`.
    #[must_use]
    pub const fn with_shape(mut self, height: u32, width: u32) -> Self {
        self.shape = (height, width);
        self
    }

    /// Set the test pattern.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Make `get_frame` time out on the given (0-based) frame requests.
    #[must_use]
    pub fn with_dropped_frames<I: IntoIterator<Item = u64>>(mut self, frames: I) -> Self {
        self.dropped_frames.extend(frames);
        self
    }

    /// Current search interval, for inspection.
    #[must_use]
    pub const fn search(&self) -> &ExposureSearch {
        &self.search
    }

    fn render(&self, position: u64) -> Samples {
        let (height, width) = self.shape;
        let full_scale = u64::from(dynamic_range(self.bit_depth));
        let exposure = u64::from(self.exposure);
        let ramp_denominator = u64::from(width.max(1)) * RAMP_FULL_SCALE_EXPOSURE_US;
        let bar_level = full_scale * 3 / 4;
        let bar_start = match self.view {
            ViewMode::Raw => position % u64::from(width.max(1)),
            ViewMode::Alternate => position % u64::from(height.max(1)),
        };
        let in_bar = |x: u64, y: u64| {
            let coord = match self.view {
                ViewMode::Raw => x,
                ViewMode::Alternate => y,
            };
            coord >= bar_start && coord < bar_start + u64::from(BAR_WIDTH)
        };

        let mut values = Vec::with_capacity(height as usize * width as usize);
        for y in 0..u64::from(height) {
            for x in 0..u64::from(width) {
                let value = match self.pattern {
                    TestPattern::Solid(level) => {
                        #[allow(
                            clippy::cast_possible_truncation,
                            clippy::cast_sign_loss,
                            clippy::cast_precision_loss
                        )]
                        let v = (f64::from(level.clamp(0.0, 1.0)) * full_scale as f64).round()
                            as u64;
                        v
                    }
                    TestPattern::Ramp | TestPattern::MovingBar => {
                        let ramp = (full_scale * (x + 1) * exposure / ramp_denominator)
                            .min(full_scale);
                        if self.pattern == TestPattern::MovingBar && in_bar(x, y) {
                            ramp.max(bar_level)
                        } else {
                            ramp
                        }
                    }
                };
                #[allow(clippy::cast_possible_truncation)]
                values.push(value as u16);
            }
        }

        if self.bit_depth > 8 {
            Samples::U16(values)
        } else {
            #[allow(clippy::cast_possible_truncation)]
            Samples::U8(values.into_iter().map(|v| v as u8).collect())
        }
    }
}

impl CaptureDevice for MockCamera {
    fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(DeviceError::AlreadyOpen);
        }
        self.open = true;
        debug!("mock camera opened");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.open = false;
        debug!("mock camera closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn toggle_bit_depth(&mut self) {
        self.bit_depth = if self.bit_depth == 16 { 8 } else { 16 };
    }

    fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    fn get_frame(&mut self, _target_fps: f64) -> Result<(RawFrame, DisplayFrame)> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        let request = self.frame_count;
        self.frame_count += 1;
        if self.dropped_frames.contains(&request) {
            return Err(DeviceError::Timeout);
        }

        let (height, width) = self.shape;
        let raw = RawFrame {
            height,
            width,
            channels: 1,
            bit_depth: self.bit_depth,
            sequence: request,
            samples: self.render(request),
        };
        let display = raw.to_display();
        Ok((raw, display))
    }

    fn shape(&self) -> (u32, u32) {
        self.shape
    }

    fn exposure(&self) -> u32 {
        self.exposure
    }

    fn exposure_range(&self) -> ExposureRange {
        MOCK_EXPOSURE_RANGE
    }

    fn set_exposure(&mut self, exposure: u32) -> Result<bool> {
        if !MOCK_EXPOSURE_RANGE.accepts(exposure) {
            return Ok(false);
        }
        self.exposure = exposure;
        self.search.set_current(exposure);
        Ok(true)
    }

    fn init_exposure(&mut self, max_exposure_hint: u32) {
        self.search.init(max_exposure_hint);
    }

    fn adjust_exposure(&mut self) -> Result<()> {
        self.exposure = self.search.adjust();
        Ok(())
    }

    fn check_exposure(&mut self, frame: &RawFrame) -> bool {
        self.search.check(frame.saturated_count(), frame.bit_depth)
    }

    fn reset_exposure_search(&mut self) {
        self.search.reset();
    }

    fn toggle_view(&mut self) {
        self.view = self.view.toggled();
    }

    fn view_mode(&self) -> ViewMode {
        self.view
    }

    fn set_save_subfolder(&mut self, name: &str) -> Result<()> {
        self.save.set_subfolder(name)
    }

    fn save_folder(&self) -> PathBuf {
        self.save.folder()
    }

    fn metadata_header(&self) -> MetadataHeader {
        MetadataHeader::new(self.shape, self.bit_depth)
            .with_extra("sensor type", "simulated")
            .with_extra("exposure time", format!("{} us", self.exposure))
    }

    fn error_kind(&self) -> BackendKind {
        BackendKind::Mock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> (tempfile::TempDir, MockCamera) {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera =
            MockCamera::new(dir.path().join("mock"), ExposureTuning::default()).expect("mock");
        (dir, camera)
    }

    #[test]
    fn test_mock_defaults() {
        let (_dir, camera) = camera();
        assert_eq!(camera.shape(), (480, 640));
        assert_eq!(camera.bit_depth(), 8);
        assert_eq!(camera.exposure(), 10_000);
        assert_eq!(camera.exposure_range(), ExposureRange::new(100, 500_000, 20));
        assert_eq!(camera.error_kind(), BackendKind::Mock);
    }

    #[test]
    fn test_mock_lifecycle() {
        let (_dir, mut camera) = camera();
        assert!(matches!(camera.get_frame(30.0), Err(DeviceError::NotOpen)));
        camera.open().expect("open");
        assert!(matches!(camera.open(), Err(DeviceError::AlreadyOpen)));
        camera.close().expect("close");
        assert!(!camera.is_open());
    }

    #[test]
    fn test_set_exposure_bounds() {
        let (_dir, mut camera) = camera();
        assert!(!camera.set_exposure(50).expect("set"));
        assert_eq!(camera.exposure(), 10_000);
        assert!(!camera.set_exposure(100).expect("set"));
        assert!(!camera.set_exposure(500_000).expect("set"));
        assert!(camera.set_exposure(100_000).expect("set"));
        assert_eq!(camera.exposure(), 100_000);
    }

    #[test]
    fn test_frame_shape_and_bit_depth() {
        let (_dir, mut camera) = camera();
        camera.open().expect("open");
        let (raw, display) = camera.get_frame(30.0).expect("frame");
        assert_eq!(raw.shape(), (480, 640));
        assert!(matches!(raw.samples, Samples::U8(_)));
        assert_eq!(display.data.len(), 480 * 640);

        camera.toggle_bit_depth();
        let (raw, _) = camera.get_frame(30.0).expect("frame");
        assert_eq!(raw.bit_depth, 16);
        assert!(matches!(raw.samples, Samples::U16(_)));
    }

    #[test]
    fn test_moving_bar_advances() {
        let (_dir, mut camera) = camera();
        camera.open().expect("open");
        let (_, first) = camera.get_frame(30.0).expect("frame");
        let (_, second) = camera.get_frame(30.0).expect("frame");
        assert!(first.value_at(0, 10, 0).expect("pixel") > 0.7);
        assert!(second.value_at(5, 10, 0).expect("pixel") > 0.7);
        assert!(second.value_at(0, 10, 0).expect("pixel") < 0.1);
    }

    #[test]
    fn test_toggle_view_moves_bar_vertically() {
        let (_dir, mut camera) = camera();
        camera.open().expect("open");
        camera.toggle_view();
        assert_eq!(camera.view_mode(), ViewMode::Alternate);
        let (_, display) = camera.get_frame(30.0).expect("frame");
        // row 0 is inside the horizontal bar on the first frame
        assert!(display.value_at(300, 0, 0).expect("pixel") > 0.7);
        assert!(display.value_at(0, 100, 0).expect("pixel") < 0.1);
    }

    #[test]
    fn test_saturation_grows_with_exposure() {
        let (_dir, camera) = camera();
        let mut camera = camera.with_pattern(TestPattern::Ramp);
        camera.open().expect("open");
        camera.set_exposure(10_000).expect("set");
        let (low, _) = camera.get_frame(30.0).expect("frame");
        camera.set_exposure(40_000).expect("set");
        let (high, _) = camera.get_frame(30.0).expect("frame");
        assert_eq!(low.saturated_count(), 0);
        assert!(high.saturated_count() > 100_000);
    }

    #[test]
    fn test_dropped_frames_time_out() {
        let (_dir, camera) = camera();
        let mut camera = camera.with_dropped_frames([1]);
        camera.open().expect("open");
        assert!(camera.get_frame(30.0).is_ok());
        assert!(matches!(camera.get_frame(30.0), Err(DeviceError::Timeout)));
        assert!(camera.get_frame(30.0).is_ok());
    }

    #[test]
    fn test_save_subfolder_created_under_root() {
        let (dir, mut camera) = camera();
        camera.set_save_subfolder("run").expect("subfolder");
        assert_eq!(camera.save_folder(), dir.path().join("mock").join("run"));
        assert!(camera.save_folder().is_dir());
    }
}
