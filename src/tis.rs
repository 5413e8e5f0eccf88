//! Bayer-mosaic industrial camera (DFK 23UX236 class).
//!
//! The camera's own property interface works in milliseconds; everything
//! crossing [`CaptureDevice`] is converted to microseconds here. Hardware
//! access goes through the [`Grabber`] trait so the acquisition logic stays
//! independent of the transport.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::demosaic;
use crate::exposure::{ExposureSearch, ExposureTuning};
use crate::sink::SaveLocation;
use crate::traits::{
    BackendKind, CaptureDevice, DeviceError, DisplayFrame, ExposureRange, MetadataHeader,
    RawFrame, Result, Samples, ViewMode,
};

/// Rows delivered by the camera.
pub const TIS_HEIGHT: u32 = 480;
/// Columns delivered by the camera.
pub const TIS_WIDTH: u32 = 640;
/// Shortest exposure, in milliseconds.
pub const TIS_MIN_EXPOSURE_MS: u32 = 15;
/// Longest exposure, in milliseconds.
pub const TIS_MAX_EXPOSURE_MS: u32 = 33_333;
/// Exposure increment, in milliseconds.
pub const TIS_EXPOSURE_INCREMENT_MS: u32 = 10;
/// Exposure applied at open, in milliseconds.
pub const TIS_DEFAULT_EXPOSURE_MS: u32 = 500;
/// Frame wait before giving up.
pub const TIS_TIMEOUT: Duration = Duration::from_secs(10);

const US_PER_MS: u32 = 1000;
const FILTER_WAVELENGTHS_NM: [u32; 4] = [550, 450, 650, 550];

/// Pixel formats the camera is driven in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit monochrome.
    Mono8,
    /// 8-bit GBRG mosaic.
    BayerGB8,
    /// 16-bit GBRG mosaic.
    BayerGB16,
}

impl PixelFormat {
    /// Bits per sample.
    #[must_use]
    pub const fn bit_depth(self) -> u8 {
        match self {
            Self::Mono8 | Self::BayerGB8 => 8,
            Self::BayerGB16 => 16,
        }
    }

    /// Whether samples form a color filter mosaic.
    #[must_use]
    pub const fn is_mosaic(self) -> bool {
        !matches!(self, Self::Mono8)
    }

    /// V4L2 fourcc for this format.
    #[must_use]
    pub const fn fourcc(self) -> &'static [u8; 4] {
        match self {
            Self::Mono8 => b"GREY",
            Self::BayerGB8 => b"GBRG",
            Self::BayerGB16 => b"GB16",
        }
    }
}

/// Stream parameters applied when the grabber opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSetup {
    /// Pixel format.
    pub pixel_format: PixelFormat,
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
    /// Initial exposure in milliseconds.
    pub exposure_ms: u32,
}

/// Transport to the physical camera.
pub trait Grabber {
    /// Open the first enumerated device, apply `setup` and start acquisition.
    fn open(&mut self, setup: &StreamSetup) -> Result<()>;

    /// Stop acquisition and close the device.
    fn close(&mut self) -> Result<()>;

    /// Write the exposure property (milliseconds).
    fn set_exposure_ms(&mut self, exposure_ms: u32) -> Result<()>;

    /// Wait up to `timeout` for a single frame.
    fn snap(&mut self, timeout: Duration) -> Result<(Samples, u64)>;
}

/// Bayer camera driven through a [`Grabber`].
#[derive(Debug)]
pub struct TisCamera<G> {
    grabber: G,
    open: bool,
    pixel_format: PixelFormat,
    exposure_us: u32,
    timeout: Duration,
    demosaic: bool,
    search: ExposureSearch,
    save: SaveLocation,
}

impl<G: Grabber> TisCamera<G> {
    /// Camera saving under `save_root`.
    pub fn new(grabber: G, save_root: PathBuf, tuning: ExposureTuning) -> Result<Self> {
        Ok(Self {
            grabber,
            open: false,
            pixel_format: PixelFormat::BayerGB16,
            exposure_us: TIS_DEFAULT_EXPOSURE_MS * US_PER_MS,
            timeout: TIS_TIMEOUT,
            demosaic: false,
            search: ExposureSearch::new(
                TIS_MIN_EXPOSURE_MS,
                TIS_MAX_EXPOSURE_MS,
                TIS_EXPOSURE_INCREMENT_MS,
                tuning,
            ),
            save: SaveLocation::new(save_root)?,
        })
    }

    /// Override the frame timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Underlying grabber.
    pub const fn grabber(&self) -> &G {
        &self.grabber
    }

    /// Current search interval in milliseconds.
    pub const fn search(&self) -> &ExposureSearch {
        &self.search
    }

    /// Writes `exposure_us` to the camera, which only takes whole
    /// milliseconds. The accepted microsecond value is what gets reported.
    fn apply_exposure(&mut self, exposure_us: u32) -> Result<()> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.grabber.set_exposure_ms(exposure_us / US_PER_MS)?;
        self.exposure_us = exposure_us;
        Ok(())
    }

    fn display(&self, raw: &RawFrame) -> DisplayFrame {
        let view = raw.to_display();
        if !(self.demosaic && self.pixel_format.is_mosaic()) {
            return view;
        }
        let rgb = demosaic::bilinear_gbrg(&view.data, raw.height as usize, raw.width as usize);
        DisplayFrame {
            height: raw.height,
            width: raw.width,
            channels: 3,
            data: rgb,
        }
    }
}

impl<G: Grabber> CaptureDevice for TisCamera<G> {
    fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(DeviceError::AlreadyOpen);
        }
        let setup = StreamSetup {
            pixel_format: self.pixel_format,
            width: TIS_WIDTH,
            height: TIS_HEIGHT,
            exposure_ms: self.exposure_us / US_PER_MS,
        };
        self.grabber
            .open(&setup)
            .map_err(|err| DeviceError::DeviceOpenFailed(err.to_string()))?;
        self.open = true;
        info!(pixel_format = ?self.pixel_format, "bayer camera streaming");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.open = false;
        self.grabber.close()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn toggle_bit_depth(&mut self) {
        debug!("bayer camera runs at a fixed bit depth");
    }

    fn bit_depth(&self) -> u8 {
        self.pixel_format.bit_depth()
    }

    fn get_frame(&mut self, _target_fps: f64) -> Result<(RawFrame, DisplayFrame)> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        let (samples, sequence) = self.grabber.snap(self.timeout)?;
        let raw = RawFrame {
            height: TIS_HEIGHT,
            width: TIS_WIDTH,
            channels: 1,
            bit_depth: self.bit_depth(),
            sequence,
            samples,
        };
        raw.ensure_complete(BackendKind::Tis)?;
        let display = self.display(&raw);
        Ok((raw, display))
    }

    fn shape(&self) -> (u32, u32) {
        (TIS_HEIGHT, TIS_WIDTH)
    }

    fn exposure(&self) -> u32 {
        self.exposure_us
    }

    fn exposure_range(&self) -> ExposureRange {
        ExposureRange::new(
            TIS_MIN_EXPOSURE_MS * US_PER_MS,
            TIS_MAX_EXPOSURE_MS * US_PER_MS,
            TIS_EXPOSURE_INCREMENT_MS * US_PER_MS,
        )
    }

    fn set_exposure(&mut self, exposure: u32) -> Result<bool> {
        if !self.exposure_range().accepts(exposure) {
            return Ok(false);
        }
        self.apply_exposure(exposure)?;
        self.search.set_current(exposure / US_PER_MS);
        Ok(true)
    }

    fn init_exposure(&mut self, max_exposure_hint: u32) {
        self.search.init(max_exposure_hint / US_PER_MS);
    }

    fn adjust_exposure(&mut self) -> Result<()> {
        let target = self.search.adjust();
        self.apply_exposure(target.saturating_mul(US_PER_MS))
    }

    fn check_exposure(&mut self, frame: &RawFrame) -> bool {
        self.search.check(frame.saturated_count(), frame.bit_depth)
    }

    fn reset_exposure_search(&mut self) {
        self.search.reset();
    }

    fn toggle_view(&mut self) {
        self.demosaic = !self.demosaic;
    }

    fn view_mode(&self) -> ViewMode {
        if self.demosaic {
            ViewMode::Alternate
        } else {
            ViewMode::Raw
        }
    }

    fn set_save_subfolder(&mut self, name: &str) -> Result<()> {
        self.save.set_subfolder(name)
    }

    fn save_folder(&self) -> PathBuf {
        self.save.folder()
    }

    fn metadata_header(&self) -> MetadataHeader {
        let mut header = MetadataHeader::new(self.shape(), self.bit_depth());
        header.sensor_type = Some("The Imaging Source DFK 23UX236".to_owned());
        header.description = Some("Bayer mosaic image snapshot.".to_owned());
        header.wavelength_units = Some("Nanometers".to_owned());
        header.wavelengths = FILTER_WAVELENGTHS_NM.to_vec();
        header
            .with_extra("spatial resolution", "1920 x 1200")
            .with_extra("spectral range", "450-650 nm")
            .with_extra("bands count", "3 bands")
            .with_extra("interface", "USB3.0 + GPIO + I/O for triggering")
            .with_extra("filter array size", "2x2")
            .with_extra(
                "note",
                "Raw mosaic. Wavelengths are listed in row-major order (left to right, top to bottom).",
            )
    }

    fn error_kind(&self) -> BackendKind {
        BackendKind::Tis
    }
}

#[cfg(feature = "tis")]
pub use transport::V4L2Grabber;

#[cfg(feature = "tis")]
mod transport {
    use std::time::Duration;

    use tracing::debug;

    use super::{Grabber, StreamSetup};
    use crate::device::{
        us_to_absolute, V4L2Link, CID_EXPOSURE_ABSOLUTE, CID_EXPOSURE_AUTO, EXPOSURE_MANUAL,
    };
    use crate::traits::{BackendKind, DeviceError, Result, Samples};

    /// [`Grabber`] over the camera's V4L2 node.
    pub struct V4L2Grabber {
        index: u32,
        timeout: Duration,
        link: Option<V4L2Link>,
        bit_depth: u8,
    }

    impl V4L2Grabber {
        /// Grabber for `/dev/video<index>`.
        #[must_use]
        pub const fn new(index: u32) -> Self {
            Self {
                index,
                timeout: super::TIS_TIMEOUT,
                link: None,
                bit_depth: 16,
            }
        }
    }

    impl Grabber for V4L2Grabber {
        fn open(&mut self, setup: &StreamSetup) -> Result<()> {
            let mut link = V4L2Link::open(BackendKind::Tis, self.index, self.timeout)?;
            link.configure(setup.width, setup.height, setup.pixel_format.fourcc())?;
            link.set_control(CID_EXPOSURE_AUTO, EXPOSURE_MANUAL)?;
            link.set_control(
                CID_EXPOSURE_ABSOLUTE,
                us_to_absolute(setup.exposure_ms.saturating_mul(super::US_PER_MS)),
            )?;
            link.start()?;
            self.bit_depth = setup.pixel_format.bit_depth();
            self.link = Some(link);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            let mut link = self.link.take().ok_or(DeviceError::NotOpen)?;
            link.stop();
            Ok(())
        }

        fn set_exposure_ms(&mut self, exposure_ms: u32) -> Result<()> {
            let link = self.link.as_ref().ok_or(DeviceError::NotOpen)?;
            link.set_control(
                CID_EXPOSURE_ABSOLUTE,
                us_to_absolute(exposure_ms.saturating_mul(super::US_PER_MS)),
            )
        }

        fn snap(&mut self, timeout: Duration) -> Result<(Samples, u64)> {
            // the stream timeout is fixed when the link starts
            if timeout != self.timeout {
                debug!(?timeout, configured = ?self.timeout, "ignoring per-snap timeout");
            }
            let bit_depth = self.bit_depth;
            let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
            let (bytes, sequence) = link.next_frame()?;
            Ok((Samples::from_le_bytes(&bytes, bit_depth), sequence))
        }
    }
}
