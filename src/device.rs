//! V4L2 transport and the monochrome V4L2 camera backend.
//!
//! [`V4L2Link`] wraps the v4l crate (device handle, format negotiation,
//! controls, mmap streaming) and is shared by every backend that talks to a
//! `/dev/video*` node. [`V4L2Camera`] is the generic monochrome camera built
//! on top of it.

use std::io;
use std::time::Duration;

use tracing::debug;
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC, Format};

use crate::traits::{BackendKind, DeviceError, Result};

/// `V4L2_CID_EXPOSURE_AUTO`.
pub const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
/// `V4L2_CID_EXPOSURE_ABSOLUTE`, in units of 100 us.
pub const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
/// `V4L2_EXPOSURE_MANUAL`.
pub const EXPOSURE_MANUAL: i64 = 1;
/// Microseconds per `V4L2_CID_EXPOSURE_ABSOLUTE` unit.
pub const EXPOSURE_ABSOLUTE_UNIT_US: u32 = 100;

const STREAM_BUFFERS: u32 = 4;

/// Integer control limits as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRange {
    /// Minimum value.
    pub minimum: i64,
    /// Maximum value.
    pub maximum: i64,
    /// Increment.
    pub step: u64,
}

/// Open V4L2 device plus its capture stream, if started.
pub struct V4L2Link {
    backend: BackendKind,
    device: Device,
    stream: Option<Stream<'static>>,
    timeout: Duration,
}

impl V4L2Link {
    /// Open `/dev/video<index>`.
    pub fn open(backend: BackendKind, index: u32, timeout: Duration) -> Result<Self> {
        let device = Device::new(index as usize)
            .map_err(|err| DeviceError::DeviceOpenFailed(err.to_string()))?;

        let caps = device
            .query_caps()
            .map_err(|err| DeviceError::DeviceOpenFailed(err.to_string()))?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(DeviceError::DeviceOpenFailed(format!(
                "{} ({}) cannot capture video",
                caps.card, caps.driver
            )));
        }
        debug!(card = %caps.card, driver = %caps.driver, "v4l2 device opened");

        Ok(Self {
            backend,
            device,
            stream: None,
            timeout,
        })
    }

    fn hw(&self, err: &io::Error) -> DeviceError {
        if err.kind() == io::ErrorKind::TimedOut {
            DeviceError::Timeout
        } else {
            DeviceError::hardware(self.backend, err)
        }
    }

    /// Negotiate `width`x`height` in `fourcc`. Fails if the driver picks a
    /// different pixel format.
    pub fn configure(&mut self, width: u32, height: u32, fourcc: &[u8; 4]) -> Result<Format> {
        let mut fmt = self.device.format().map_err(|err| self.hw(&err))?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = FourCC::new(fourcc);

        let actual = self.device.set_format(&fmt).map_err(|err| self.hw(&err))?;
        if actual.fourcc != FourCC::new(fourcc) {
            return Err(DeviceError::hardware(
                self.backend,
                format!(
                    "pixel format {} not supported, driver chose {}",
                    String::from_utf8_lossy(fourcc),
                    actual.fourcc
                ),
            ));
        }
        Ok(actual)
    }

    /// Start mmap streaming.
    pub fn start(&mut self) -> Result<()> {
        let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|err| self.hw(&err))?;
        stream.set_timeout(self.timeout);
        self.stream = Some(stream);
        Ok(())
    }

    /// Stop streaming; buffers are released when the stream drops.
    pub fn stop(&mut self) {
        self.stream = None;
    }

    /// Block for the next buffer and copy out its payload.
    pub fn next_frame(&mut self) -> Result<(Vec<u8>, u64)> {
        let backend = self.backend;
        let stream = self.stream.as_mut().ok_or(DeviceError::NotOpen)?;
        let (buf, meta) = stream.next().map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                DeviceError::Timeout
            } else {
                DeviceError::hardware(backend, err)
            }
        })?;
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = buf.get(..used).unwrap_or(buf).to_vec();
        Ok((payload, u64::from(meta.sequence)))
    }

    /// Limits of an integer control, if the driver exposes it.
    pub fn control_range(&self, id: u32) -> Option<ControlRange> {
        let controls = self.device.query_controls().ok()?;
        controls
            .into_iter()
            .find(|desc| desc.id == id)
            .map(|desc| ControlRange {
                minimum: desc.minimum,
                maximum: desc.maximum,
                step: desc.step,
            })
    }

    /// Read an integer control.
    pub fn control(&self, id: u32) -> Result<i64> {
        let control = self.device.control(id).map_err(|err| self.hw(&err))?;
        match control.value {
            Value::Integer(value) => Ok(value),
            other => Err(DeviceError::hardware(
                self.backend,
                format!("control {id:#x} is not an integer: {other:?}"),
            )),
        }
    }

    /// Write an integer control.
    pub fn set_control(&self, id: u32, value: i64) -> Result<()> {
        self.device
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(|err| self.hw(&err))
    }
}

/// Convert microseconds to `V4L2_CID_EXPOSURE_ABSOLUTE` units.
#[must_use]
pub const fn us_to_absolute(exposure_us: u32) -> i64 {
    (exposure_us / EXPOSURE_ABSOLUTE_UNIT_US) as i64
}

/// Convert `V4L2_CID_EXPOSURE_ABSOLUTE` units to microseconds.
#[must_use]
pub fn absolute_to_us(value: i64) -> u32 {
    u32::try_from(value.max(0))
        .unwrap_or(u32::MAX)
        .saturating_mul(EXPOSURE_ABSOLUTE_UNIT_US)
}

#[cfg(feature = "v4l2")]
pub use camera::V4L2Camera;

#[cfg(feature = "v4l2")]
mod camera {
    use std::path::PathBuf;
    use std::time::Duration;

    use tracing::{info, warn};

    use super::{
        absolute_to_us, us_to_absolute, V4L2Link, CID_EXPOSURE_ABSOLUTE, CID_EXPOSURE_AUTO,
        EXPOSURE_MANUAL,
    };
    use crate::exposure::{ExposureSearch, ExposureTuning};
    use crate::sink::SaveLocation;
    use crate::traits::{
        BackendKind, CaptureDevice, DeviceError, DisplayFrame, ExposureRange, MetadataHeader,
        RawFrame, Result, Samples, ViewMode,
    };

    const FALLBACK_RANGE: ExposureRange = ExposureRange::new(100, 500_000, 100);
    const DEFAULT_EXPOSURE_US: u32 = 10_000;

    const fn fourcc_for(bit_depth: u8) -> &'static [u8; 4] {
        if bit_depth > 8 {
            b"Y16 "
        } else {
            b"GREY"
        }
    }

    /// Monochrome UVC/V4L2 camera streaming GREY (8-bit) or Y16 (16-bit).
    pub struct V4L2Camera {
        index: u32,
        shape: (u32, u32),
        timeout: Duration,
        bit_depth: u8,
        link: Option<V4L2Link>,
        exposure: u32,
        range: ExposureRange,
        has_exposure_control: bool,
        search: ExposureSearch,
        view: ViewMode,
        save: SaveLocation,
    }

    impl V4L2Camera {
        /// Camera on `/dev/video<index>` requesting `shape = (height, width)`.
        pub fn new(
            index: u32,
            shape: (u32, u32),
            timeout: Duration,
            save_root: PathBuf,
            tuning: ExposureTuning,
        ) -> Result<Self> {
            let range = FALLBACK_RANGE;
            Ok(Self {
                index,
                shape,
                timeout,
                bit_depth: 8,
                link: None,
                exposure: DEFAULT_EXPOSURE_US,
                range,
                has_exposure_control: false,
                search: ExposureSearch::new(range.min, range.max, range.step, tuning),
                view: ViewMode::Raw,
                save: SaveLocation::new(save_root)?,
            })
        }

        fn link(&mut self) -> Result<&mut V4L2Link> {
            self.link.as_mut().ok_or(DeviceError::NotOpen)
        }

        fn start_stream(&mut self) -> Result<()> {
            let (height, width) = self.shape;
            let fourcc = fourcc_for(self.bit_depth);
            let link = self.link()?;
            let format = link.configure(width, height, fourcc)?;
            link.start()?;
            self.shape = (format.height, format.width);
            Ok(())
        }

        fn read_exposure_control(&mut self) {
            let Some(link) = self.link.as_ref() else {
                return;
            };
            if link.set_control(CID_EXPOSURE_AUTO, EXPOSURE_MANUAL).is_err() {
                warn!("could not switch exposure to manual mode");
            }
            match link.control_range(CID_EXPOSURE_ABSOLUTE) {
                Some(range) => {
                    let step = u32::try_from(range.step)
                        .unwrap_or(1)
                        .max(1)
                        .saturating_mul(super::EXPOSURE_ABSOLUTE_UNIT_US);
                    self.range = ExposureRange::new(
                        absolute_to_us(range.minimum),
                        absolute_to_us(range.maximum),
                        step,
                    );
                    self.has_exposure_control = true;
                    if let Ok(value) = link.control(CID_EXPOSURE_ABSOLUTE) {
                        self.exposure = absolute_to_us(value);
                    }
                }
                None => {
                    warn!("device has no absolute exposure control");
                    self.range = FALLBACK_RANGE;
                    self.has_exposure_control = false;
                }
            }
            self.search
                .rebound(self.range.min, self.range.max, self.range.step);
            self.search.set_current(self.exposure);
        }

        fn write_exposure(&mut self, exposure: u32) -> Result<()> {
            if !self.has_exposure_control {
                return Err(DeviceError::hardware(
                    BackendKind::V4l2,
                    "exposure control not supported",
                ));
            }
            self.link()?
                .set_control(CID_EXPOSURE_ABSOLUTE, us_to_absolute(exposure))?;
            self.exposure = exposure;
            Ok(())
        }

        fn display(&self, raw: &RawFrame) -> DisplayFrame {
            let mut display = raw.to_display();
            if self.view == ViewMode::Alternate {
                let lo = display.data.iter().copied().fold(f32::INFINITY, f32::min);
                let hi = display.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let span = hi - lo;
                if span > f32::EPSILON {
                    for value in &mut display.data {
                        *value = (*value - lo) / span;
                    }
                }
            }
            display
        }
    }

    impl CaptureDevice for V4L2Camera {
        fn open(&mut self) -> Result<()> {
            if self.link.is_some() {
                return Err(DeviceError::AlreadyOpen);
            }
            self.link = Some(V4L2Link::open(BackendKind::V4l2, self.index, self.timeout)?);
            if let Err(err) = self.start_stream() {
                self.link = None;
                return Err(DeviceError::DeviceOpenFailed(err.to_string()));
            }
            self.read_exposure_control();
            info!(index = self.index, shape = ?self.shape, "v4l2 camera streaming");
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            let mut link = self.link.take().ok_or(DeviceError::NotOpen)?;
            link.stop();
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.link.is_some()
        }

        fn toggle_bit_depth(&mut self) {
            let previous = self.bit_depth;
            self.bit_depth = if previous == 16 { 8 } else { 16 };
            let Some(link) = self.link.as_mut() else {
                return;
            };
            link.stop();
            if let Err(err) = self.start_stream() {
                warn!(error = %err, "bit depth switch failed, restoring");
                self.bit_depth = previous;
                if let Err(err) = self.start_stream() {
                    warn!(error = %err, "could not restart stream");
                }
            }
        }

        fn bit_depth(&self) -> u8 {
            self.bit_depth
        }

        fn get_frame(&mut self, _target_fps: f64) -> Result<(RawFrame, DisplayFrame)> {
            let bit_depth = self.bit_depth;
            let (height, width) = self.shape;
            let (bytes, sequence) = self.link()?.next_frame()?;
            let samples = Samples::from_le_bytes(&bytes, bit_depth);
            let raw = RawFrame {
                height,
                width,
                channels: 1,
                bit_depth,
                sequence,
                samples,
            };
            raw.ensure_complete(BackendKind::V4l2)?;
            let display = self.display(&raw);
            Ok((raw, display))
        }

        fn shape(&self) -> (u32, u32) {
            self.shape
        }

        fn exposure(&self) -> u32 {
            self.exposure
        }

        fn exposure_range(&self) -> ExposureRange {
            self.range
        }

        fn set_exposure(&mut self, exposure: u32) -> Result<bool> {
            if !self.range.accepts(exposure) {
                return Ok(false);
            }
            self.write_exposure(exposure)?;
            self.search.set_current(exposure);
            Ok(true)
        }

        fn init_exposure(&mut self, max_exposure_hint: u32) {
            self.search.init(max_exposure_hint);
        }

        fn adjust_exposure(&mut self) -> Result<()> {
            let target = self.search.adjust();
            self.write_exposure(target)
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
                .with_extra("sensor type", format!("V4L2 /dev/video{}", self.index))
                .with_extra("exposure time", format!("{} us", self.exposure))
        }

        fn error_kind(&self) -> BackendKind {
            BackendKind::V4l2
        }
    }
}
