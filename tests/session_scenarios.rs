//! End-to-end session scenarios against the simulated backend and a scripted
//! device.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use spectra_cam_capture::config::SessionConfig;
use spectra_cam_capture::exposure::{ExposureEstimator, StepOutcome};
use spectra_cam_capture::session::{CaptureSession, DeviceFactory, TickOutcome};
use spectra_cam_capture::sink::{FrameSink, SaveError, SaveFormat};
use spectra_cam_capture::{
    BackendKind, CaptureDevice, DeviceError, DisplayFrame, ExposureRange, ExposureSearch,
    ExposureTuning, MetadataHeader, MockCamera, RawFrame, Samples, TestPattern, ViewMode,
};

#[derive(Debug, Clone)]
struct SaveCall {
    stem: String,
    shape: (u32, u32),
    samples: usize,
}

#[derive(Debug, Default, Clone)]
struct RecordingSink {
    calls: Rc<RefCell<Vec<SaveCall>>>,
}

impl FrameSink for RecordingSink {
    fn save(
        &mut self,
        frame: &RawFrame,
        _folder: &Path,
        stem: &str,
        _header: &MetadataHeader,
        _format: SaveFormat,
    ) -> Result<(), SaveError> {
        self.calls.borrow_mut().push(SaveCall {
            stem: stem.to_owned(),
            shape: frame.shape(),
            samples: frame.samples.len(),
        });
        Ok(())
    }
}

/// Device whose saturated-sample count follows a script instead of optics.
struct ScriptedDevice {
    open: bool,
    exposure: u32,
    saturation: Box<dyn FnMut(u32) -> u64>,
    search: ExposureSearch,
    fail_set_exposure: bool,
    save_root: PathBuf,
    sequence: u64,
}

const SCRIPTED_RANGE: ExposureRange = ExposureRange::new(100, 500_000, 20);
const SCRIPTED_SHAPE: (u32, u32) = (32, 32);

impl ScriptedDevice {
    fn new(save_root: PathBuf, saturation: Box<dyn FnMut(u32) -> u64>) -> Self {
        Self {
            open: false,
            exposure: 10_000,
            saturation,
            search: ExposureSearch::new(
                SCRIPTED_RANGE.min,
                SCRIPTED_RANGE.max,
                SCRIPTED_RANGE.step,
                ExposureTuning::default(),
            ),
            fail_set_exposure: false,
            save_root,
            sequence: 0,
        }
    }
}

impl CaptureDevice for ScriptedDevice {
    fn open(&mut self) -> spectra_cam_capture::traits::Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> spectra_cam_capture::traits::Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn toggle_bit_depth(&mut self) {}

    fn bit_depth(&self) -> u8 {
        16
    }

    fn get_frame(
        &mut self,
        _target_fps: f64,
    ) -> spectra_cam_capture::traits::Result<(RawFrame, DisplayFrame)> {
        let total = (SCRIPTED_SHAPE.0 * SCRIPTED_SHAPE.1) as usize;
        let saturated = usize::try_from((self.saturation)(self.exposure))
            .unwrap_or(total)
            .min(total);
        let mut data = vec![0_u16; total];
        for value in data.iter_mut().take(saturated) {
            *value = u16::MAX;
        }
        self.sequence += 1;
        let raw = RawFrame {
            height: SCRIPTED_SHAPE.0,
            width: SCRIPTED_SHAPE.1,
            channels: 1,
            bit_depth: 16,
            sequence: self.sequence,
            samples: Samples::U16(data),
        };
        let display = raw.to_display();
        Ok((raw, display))
    }

    fn shape(&self) -> (u32, u32) {
        SCRIPTED_SHAPE
    }

    fn exposure(&self) -> u32 {
        self.exposure
    }

    fn exposure_range(&self) -> ExposureRange {
        SCRIPTED_RANGE
    }

    fn set_exposure(&mut self, exposure: u32) -> spectra_cam_capture::traits::Result<bool> {
        if self.fail_set_exposure {
            // half-applied write
            self.exposure = exposure / 2;
            return Err(DeviceError::hardware(BackendKind::Mock, "bus reset"));
        }
        if !SCRIPTED_RANGE.accepts(exposure) {
            return Ok(false);
        }
        self.exposure = exposure;
        self.search.set_current(exposure);
        Ok(true)
    }

    fn init_exposure(&mut self, max_exposure_hint: u32) {
        self.search.init(max_exposure_hint);
    }

    fn adjust_exposure(&mut self) -> spectra_cam_capture::traits::Result<()> {
        self.exposure = self.search.adjust();
        Ok(())
    }

    fn check_exposure(&mut self, frame: &RawFrame) -> bool {
        self.search.check(frame.saturated_count(), frame.bit_depth)
    }

    fn reset_exposure_search(&mut self) {
        self.search.reset();
    }

    fn toggle_view(&mut self) {}

    fn view_mode(&self) -> ViewMode {
        ViewMode::Raw
    }

    fn set_save_subfolder(&mut self, _name: &str) -> spectra_cam_capture::traits::Result<()> {
        Ok(())
    }

    fn save_folder(&self) -> PathBuf {
        self.save_root.clone()
    }

    fn metadata_header(&self) -> MetadataHeader {
        MetadataHeader::new(SCRIPTED_SHAPE, 16)
    }

    fn error_kind(&self) -> BackendKind {
        BackendKind::Mock
    }
}

fn mock_session(dir: &tempfile::TempDir) -> (CaptureSession, Rc<RefCell<Vec<SaveCall>>>) {
    let sink = RecordingSink::default();
    let calls = Rc::clone(&sink.calls);
    let root = dir.path().join("mock");
    let factory: DeviceFactory = Box::new(move |_kind| {
        let camera = MockCamera::new(root.clone(), ExposureTuning::default())?
            .with_shape(480, 640)
            .with_pattern(TestPattern::MovingBar);
        Ok(Box::new(camera) as Box<dyn CaptureDevice>)
    });
    let session = CaptureSession::with_factory(&SessionConfig::default(), 50, factory, Box::new(sink))
        .expect("session");
    (session, calls)
}

#[test]
fn test_five_recorded_ticks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut session, calls) = mock_session(&dir);
    session.start().expect("start");
    session.toggle_recording().expect("record");

    for _ in 0..5 {
        assert_eq!(session.on_tick(), TickOutcome::Frame { saved: true });
    }

    let calls = calls.borrow();
    let stems: Vec<&str> = calls.iter().map(|c| c.stem.as_str()).collect();
    assert_eq!(
        stems,
        ["frame_0000", "frame_0001", "frame_0002", "frame_0003", "frame_0004"]
    );
    assert!(calls
        .iter()
        .all(|c| c.shape == (480, 640) && c.samples == 480 * 640));
}

#[test]
fn test_no_writes_unless_recording() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut session, calls) = mock_session(&dir);
    session.start().expect("start");
    for _ in 0..3 {
        session.on_tick();
    }
    session.toggle_recording().expect("record");
    session.toggle_recording().expect("stop recording");
    for _ in 0..3 {
        session.on_tick();
    }
    assert!(calls.borrow().is_empty());
    assert!(session.published().display.is_some());
}

#[test]
fn test_envi_sink_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("mock");
    let factory: DeviceFactory = Box::new(move |_kind| {
        Ok(Box::new(MockCamera::new(root.clone(), ExposureTuning::default())?)
            as Box<dyn CaptureDevice>)
    });
    let mut session = CaptureSession::with_factory(
        &SessionConfig::default(),
        50,
        factory,
        Box::new(spectra_cam_capture::EnviSink),
    )
    .expect("session");

    session.start().expect("start");
    session.toggle_recording().expect("record");
    session.on_tick();
    session.on_tick();
    let folder = session.device().expect("device").save_folder();
    session.stop().expect("stop");

    let image = std::fs::read(folder.join("frame_0001.img")).expect("image");
    assert_eq!(image.len(), 480 * 640);
    let header = std::fs::read_to_string(folder.join("frame_0001.hdr")).expect("header");
    assert!(header.contains("samples = 640"));
    assert!(header.contains("lines = 480"));
    assert!(header.contains("data type = 1"));
}

#[test]
fn test_estimator_gives_up_for_any_saturation_sequence() {
    let dir = tempfile::tempdir().expect("tempdir");
    // pseudo-random saturation unrelated to exposure
    let mut state: u64 = 0x2545_f491;
    let mut device = ScriptedDevice::new(
        dir.path().to_path_buf(),
        Box::new(move |_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (state >> 33) % 1024
        }),
    );
    device.open().expect("open");

    let mut estimator = ExposureEstimator::default();
    estimator.begin(&mut device, 30.0);
    let mut outcome = StepOutcome::Continue;
    for _ in 0..50 {
        estimator.before_frame(&mut device);
        let frame = device.get_frame(30.0).ok().map(|(raw, _)| raw);
        outcome = estimator.after_frame(&mut device, frame.as_ref());
        if outcome.is_finished() {
            break;
        }
    }
    assert!(outcome.is_finished(), "estimator still running: {outcome:?}");
    assert!(!estimator.is_searching());
}

#[test]
fn test_estimator_stops_at_max_tries_without_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut device = ScriptedDevice::new(dir.path().to_path_buf(), Box::new(|_| 0));
    let mut estimator = ExposureEstimator::default();
    estimator.begin(&mut device, 30.0);
    let mut last = StepOutcome::Idle;
    for _ in 0..50 {
        last = estimator.after_frame(&mut device, None);
    }
    assert_eq!(last, StepOutcome::GaveUp { tries: 50 });
    assert_eq!(estimator.after_frame(&mut device, None), StepOutcome::Idle);
}

#[test]
fn test_estimator_converges_on_monotone_scene() {
    let dir = tempfile::tempdir().expect("tempdir");
    // 16-bit target is 100 saturated samples, reached around 10 ms
    let mut device = ScriptedDevice::new(
        dir.path().to_path_buf(),
        Box::new(|exposure| u64::from(exposure / 100)),
    );
    device.open().expect("open");
    let mut estimator = ExposureEstimator::default();
    estimator.begin(&mut device, 30.0);

    let mut widths = Vec::new();
    let mut outcome = StepOutcome::Continue;
    while !outcome.is_finished() {
        estimator.before_frame(&mut device);
        let (raw, _) = device.get_frame(30.0).expect("frame");
        outcome = estimator.after_frame(&mut device, Some(&raw));
        if !outcome.is_finished() {
            let (min, max) = device.search.bounds();
            widths.push(i64::from(max) - i64::from(min));
        }
    }

    assert!(matches!(outcome, StepOutcome::Converged { .. }));
    assert!(widths.windows(2).all(|w| w[1] <= w[0]), "{widths:?}");
    let saturated = u64::from(device.exposure() / 100);
    assert!(saturated.abs_diff(100) <= 20, "saturated = {saturated}");
}

#[test]
fn test_session_estimation_on_mock_ramp() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("mock");
    let factory: DeviceFactory = Box::new(move |_kind| {
        let camera = MockCamera::new(root.clone(), ExposureTuning::default())?
            .with_pattern(TestPattern::Ramp);
        Ok(Box::new(camera) as Box<dyn CaptureDevice>)
    });
    let mut session = CaptureSession::with_factory(
        &SessionConfig::default(),
        50,
        factory,
        Box::new(RecordingSink::default()),
    )
    .expect("session");
    session.start().expect("start");
    session.toggle_exposure_estimation().expect("estimate");

    let mut ticks = 0;
    while session.is_estimating_exposure() {
        assert_eq!(session.on_tick(), TickOutcome::Frame { saved: false });
        ticks += 1;
    }
    assert!(ticks <= 50);
    let exposure = session.published().exposure;
    assert!(exposure > 100 && exposure <= 33_333, "exposure = {exposure}");
}

#[test]
fn test_set_exposure_failure_rereads_device() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();
    let factory: DeviceFactory = Box::new(move |_kind| {
        let mut device = ScriptedDevice::new(root.clone(), Box::new(|_| 0));
        device.fail_set_exposure = true;
        Ok(Box::new(device) as Box<dyn CaptureDevice>)
    });
    let mut session = CaptureSession::with_factory(
        &SessionConfig::default(),
        50,
        factory,
        Box::new(RecordingSink::default()),
    )
    .expect("session");
    session.start().expect("start");

    let applied = session.set_exposure(30_000).expect("set exposure");
    assert_eq!(applied, 15_000);
    assert_eq!(session.published().exposure, 15_000);
    assert!(session.is_running());
}

/// Sink that rejects its first write and records the rest.
#[derive(Debug, Default)]
struct FailFirstSink {
    failed: bool,
    inner: RecordingSink,
}

impl FrameSink for FailFirstSink {
    fn save(
        &mut self,
        frame: &RawFrame,
        folder: &Path,
        stem: &str,
        header: &MetadataHeader,
        format: SaveFormat,
    ) -> Result<(), SaveError> {
        if !self.failed {
            self.failed = true;
            return Err(SaveError::MissingFolder(folder.to_path_buf()));
        }
        self.inner.save(frame, folder, stem, header, format)
    }
}

#[test]
fn test_failed_save_keeps_frame_number() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("mock");
    let factory: DeviceFactory = Box::new(move |_kind| {
        Ok(Box::new(MockCamera::new(root.clone(), ExposureTuning::default())?)
            as Box<dyn CaptureDevice>)
    });
    let sink = FailFirstSink::default();
    let calls = Rc::clone(&sink.inner.calls);
    let mut session =
        CaptureSession::with_factory(&SessionConfig::default(), 50, factory, Box::new(sink))
            .expect("session");
    session.start().expect("start");
    session.toggle_recording().expect("record");

    assert_eq!(session.on_tick(), TickOutcome::Frame { saved: false });
    assert_eq!(session.frame_counter(), 0);
    assert!(session.is_running());
    assert_eq!(session.on_tick(), TickOutcome::Frame { saved: true });
    assert_eq!(session.on_tick(), TickOutcome::Frame { saved: true });

    let stems: Vec<String> = calls.borrow().iter().map(|c| c.stem.clone()).collect();
    assert_eq!(stems, ["frame_0000", "frame_0001"]);
    assert_eq!(session.frame_counter(), 2);
}
