//! Core traits and types for the capture-device abstraction.
//!
//! Every backend (simulated, V4L2, Bayer camera) implements [`CaptureDevice`]
//! so that client code can drive them identically. Exposure values crossing
//! this boundary are always microseconds; backends convert internally.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::Deserialize;

/// Identifier of a concrete backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Simulated camera, always available.
    #[default]
    #[serde(alias = "simulated")]
    Mock,
    /// Monochrome V4L2/UVC camera (hardware backend A).
    #[serde(alias = "hardware-a")]
    V4l2,
    /// Bayer-mosaic camera (hardware backend B).
    #[serde(alias = "hardware-b")]
    Tis,
}

impl BackendKind {
    /// All backends known to this crate, compiled in or not.
    pub const ALL: [Self; 3] = [Self::Mock, Self::V4l2, Self::Tis];

    /// Canonical lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::V4l2 => "v4l2",
            Self::Tis => "tis",
        }
    }

    /// Whether the backend's hardware support was compiled into this build.
    #[must_use]
    pub const fn is_compiled(self) -> bool {
        match self {
            Self::Mock => true,
            Self::V4l2 => cfg!(feature = "v4l2"),
            Self::Tis => cfg!(feature = "tis"),
        }
    }

    /// Backends usable in this build.
    #[must_use]
    pub fn available() -> Vec<Self> {
        Self::ALL.into_iter().filter(|kind| kind.is_compiled()).collect()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" | "simulated" => Ok(Self::Mock),
            "v4l2" | "hardware-a" => Ok(Self::V4l2),
            "tis" | "hardware-b" => Ok(Self::Tis),
            other => Err(DeviceError::UnknownBackend(other.to_owned())),
        }
    }
}

/// Maximum representable sample value for a bit depth (`2^bit_depth - 1`).
#[must_use]
pub const fn dynamic_range(bit_depth: u8) -> u16 {
    if bit_depth >= 16 {
        u16::MAX
    } else {
        (1u16 << bit_depth) - 1
    }
}

/// Backend-native sample buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Samples {
    /// 8-bit samples.
    U8(Vec<u8>),
    /// 16-bit samples.
    U16(Vec<u16>),
}

impl Samples {
    /// Decode a little-endian byte buffer as samples of the given bit depth.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8], bit_depth: u8) -> Self {
        if bit_depth > 8 {
            Self::U16(
                bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect(),
            )
        } else {
            Self::U8(bytes.to_vec())
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::U8(data) => data.len(),
            Self::U16(data) => data.len(),
        }
    }

    /// Whether the buffer holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate samples widened to 16 bits.
    pub fn iter(&self) -> Box<dyn Iterator<Item = u16> + '_> {
        match self {
            Self::U8(data) => Box::new(data.iter().copied().map(u16::from)),
            Self::U16(data) => Box::new(data.iter().copied()),
        }
    }

    /// Count samples at or above `ceiling`.
    #[must_use]
    pub fn count_at_or_above(&self, ceiling: u16) -> u64 {
        self.iter().filter(|&v| v >= ceiling).count() as u64
    }

    /// Little-endian byte representation.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::U8(data) => data.clone(),
            Self::U16(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

/// A frame as delivered by the backend. This is what gets persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Rows.
    pub height: u32,
    /// Columns.
    pub width: u32,
    /// Interleaved channels per pixel.
    pub channels: u32,
    /// Significant bits per sample.
    pub bit_depth: u8,
    /// Frame sequence number as counted by the backend.
    pub sequence: u64,
    /// Sample buffer, row-major, channels interleaved.
    pub samples: Samples,
}

impl RawFrame {
    /// `(height, width)`.
    #[must_use]
    pub const fn shape(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    /// Sample count the shape calls for.
    #[must_use]
    pub const fn expected_len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }

    /// Fails with a hardware error from `backend` when the buffer does not
    /// fill the shape.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Hardware`] on a short or oversized buffer.
    pub fn ensure_complete(&self, backend: BackendKind) -> Result<()> {
        let expected = self.expected_len();
        if self.samples.len() == expected {
            return Ok(());
        }
        Err(DeviceError::hardware(
            backend,
            format!(
                "frame holds {} samples, {}x{} needs {expected}",
                self.samples.len(),
                self.height,
                self.width
            ),
        ))
    }

    /// Dynamic range of this frame's bit depth.
    #[must_use]
    pub const fn dynamic_range(&self) -> u16 {
        dynamic_range(self.bit_depth)
    }

    /// Samples at or above the dynamic range ceiling.
    #[must_use]
    pub fn saturated_count(&self) -> u64 {
        self.samples.count_at_or_above(self.dynamic_range())
    }

    /// Normalized single-plane view: samples divided by the dynamic range,
    /// channels averaged.
    #[must_use]
    pub fn to_display(&self) -> DisplayFrame {
        let scale = f32::from(self.dynamic_range());
        let channels = self.channels.max(1) as usize;
        let values: Vec<f32> = self.samples.iter().map(|v| f32::from(v) / scale).collect();
        #[allow(clippy::cast_precision_loss)]
        let data = values
            .chunks(channels)
            .map(|px| px.iter().sum::<f32>() / channels as f32)
            .collect();
        DisplayFrame {
            height: self.height,
            width: self.width,
            channels: 1,
            data,
        }
    }
}

/// A normalized image ready for rendering; every value lies in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    /// Rows.
    pub height: u32,
    /// Columns.
    pub width: u32,
    /// 1 (grayscale) or 3 (RGB).
    pub channels: u32,
    /// Row-major, channels interleaved.
    pub data: Vec<f32>,
}

impl DisplayFrame {
    /// Value at pixel `(x, y)`, channel `c`.
    #[must_use]
    pub fn value_at(&self, x: u32, y: u32, c: u32) -> Option<f32> {
        if x >= self.width || y >= self.height || c >= self.channels {
            return None;
        }
        let index = ((y * self.width + x) * self.channels + c) as usize;
        self.data.get(index).copied()
    }

    /// Quantize to 8 bits per channel for display surfaces.
    #[must_use]
    pub fn to_u8(&self) -> Vec<u8> {
        self.data
            .iter()
            .map(|v| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let q = (v * 255.0).clamp(0.0, 255.0) as u8;
                q
            })
            .collect()
    }
}

/// Exposure limits in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureRange {
    /// Lower bound (exclusive for `set_exposure`).
    pub min: u32,
    /// Upper bound (exclusive for `set_exposure`).
    pub max: u32,
    /// Increment.
    pub step: u32,
}

impl ExposureRange {
    /// Create a new range.
    #[must_use]
    pub const fn new(min: u32, max: u32, step: u32) -> Self {
        Self { min, max, step }
    }

    /// Whether `value` lies strictly between `min` and `max`.
    #[must_use]
    pub const fn accepts(&self, value: u32) -> bool {
        value > self.min && value < self.max
    }

    /// Round `value` down to a multiple of `step`.
    #[must_use]
    pub const fn snap_down(&self, value: u32) -> u32 {
        if self.step == 0 {
            value
        } else {
            value - value % self.step
        }
    }
}

/// Secondary rendering mode toggled by `toggle_view`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    /// Backend's primary rendering.
    #[default]
    Raw,
    /// Backend's alternate rendering (e.g. demosaiced).
    Alternate,
}

impl ViewMode {
    /// The other mode.
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Raw => Self::Alternate,
            Self::Alternate => Self::Raw,
        }
    }
}

/// Acquisition metadata handed to the save capability alongside each frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataHeader {
    /// Columns.
    pub samples: u32,
    /// Rows.
    pub lines: u32,
    /// Bands stored per pixel.
    pub bands: u32,
    /// Band interleave (`bsq`, `bil`, `bip`).
    pub interleave: String,
    /// 0 little endian, 1 big endian.
    pub byte_order: u8,
    /// ENVI data type code (1 = u8, 12 = u16).
    pub data_type: u8,
    /// Significant bits per sample.
    pub bit_depth: u8,
    /// Time the header was generated.
    pub acquisition_time: DateTime<Local>,
    /// Free-text description.
    pub description: Option<String>,
    /// Sensor model.
    pub sensor_type: Option<String>,
    /// Units for `wavelengths`.
    pub wavelength_units: Option<String>,
    /// Per-band or per-filter wavelengths.
    pub wavelengths: Vec<u32>,
    /// Backend-specific entries.
    pub extra: BTreeMap<String, String>,
}

impl MetadataHeader {
    /// Header for a single-band little-endian BSQ frame.
    #[must_use]
    pub fn new(shape: (u32, u32), bit_depth: u8) -> Self {
        Self {
            samples: shape.1,
            lines: shape.0,
            bands: 1,
            interleave: "bsq".to_owned(),
            byte_order: 0,
            data_type: if bit_depth > 8 { 12 } else { 1 },
            bit_depth,
            acquisition_time: Local::now(),
            description: None,
            sensor_type: None,
            wavelength_units: None,
            wavelengths: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Add a backend-specific entry.
    #[must_use]
    pub fn with_extra<V: Into<String>>(mut self, key: &str, value: V) -> Self {
        self.extra.insert(key.to_owned(), value.into());
        self
    }
}

/// Error type for capture-device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Opening or configuring the device failed.
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// No frame was delivered in time.
    #[error("Timed out waiting for frame")]
    Timeout,
    /// Hardware fault during an in-flight call.
    #[error("{backend} hardware error: {message}")]
    Hardware {
        /// Backend that raised the error.
        backend: BackendKind,
        /// Driver message.
        message: String,
    },
    /// Exposure value outside the device range.
    #[error("Exposure {value} us outside ({min}, {max})")]
    InvalidExposure {
        /// Requested value.
        value: u32,
        /// Exclusive lower bound.
        min: u32,
        /// Exclusive upper bound.
        max: u32,
    },
    /// Registry lookup miss.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
    /// Backend known but not compiled into this build.
    #[error("Backend {0} is not available in this build")]
    BackendUnavailable(BackendKind),
    /// `open` called twice.
    #[error("Device already open")]
    AlreadyOpen,
    /// Streaming call before `open`.
    #[error("Device not open")]
    NotOpen,
    /// Save subfolder name is empty or not a single path component.
    #[error("Invalid save subfolder: {0:?}")]
    InvalidSubfolder(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Shorthand for a hardware error.
    pub fn hardware<M: fmt::Display>(backend: BackendKind, message: M) -> Self {
        Self::Hardware {
            backend,
            message: message.to_string(),
        }
    }

    /// Backend that raised this error, for hardware errors.
    #[must_use]
    pub const fn backend(&self) -> Option<BackendKind> {
        match self {
            Self::Hardware { backend, .. } => Some(*backend),
            _ => None,
        }
    }
}

/// Result type for capture-device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Capability interface implemented identically by every backend.
pub trait CaptureDevice {
    /// Acquire the device, apply the default format and start streaming.
    fn open(&mut self) -> Result<()>;

    /// Stop streaming and release the device.
    fn close(&mut self) -> Result<()>;

    /// Whether `open` succeeded and `close` has not been called since.
    fn is_open(&self) -> bool;

    /// Switch between the backend's two bit depths (no-op if it has one).
    fn toggle_bit_depth(&mut self);

    /// Current bit depth.
    fn bit_depth(&self) -> u8;

    /// Block until a frame is available, returning `(raw, display)`.
    fn get_frame(&mut self, target_fps: f64) -> Result<(RawFrame, DisplayFrame)>;

    /// `(height, width)`.
    fn shape(&self) -> (u32, u32);

    /// Current exposure in microseconds.
    fn exposure(&self) -> u32;

    /// Exposure limits in microseconds.
    fn exposure_range(&self) -> ExposureRange;

    /// Apply `exposure` (microseconds). Returns `Ok(false)` without any
    /// change when the value is not strictly inside the range.
    fn set_exposure(&mut self, exposure: u32) -> Result<bool>;

    /// Seed the auto-exposure search interval, clipped to the backend ceiling.
    fn init_exposure(&mut self, max_exposure_hint: u32);

    /// Move the exposure to the midpoint of the search interval.
    fn adjust_exposure(&mut self) -> Result<()>;

    /// Narrow the search interval from `frame` and report convergence.
    fn check_exposure(&mut self, frame: &RawFrame) -> bool;

    /// Restore the search interval to the backend's absolute bounds.
    fn reset_exposure_search(&mut self);

    /// Flip the secondary rendering mode.
    fn toggle_view(&mut self);

    /// Current rendering mode.
    fn view_mode(&self) -> ViewMode;

    /// Create (if needed) and select `name` under the save root.
    fn set_save_subfolder(&mut self, name: &str) -> Result<()>;

    /// Folder frames are currently saved into.
    fn save_folder(&self) -> PathBuf;

    /// Acquisition metadata for the external serializer.
    fn metadata_header(&self) -> MetadataHeader;

    /// Backend whose hardware errors this device raises.
    fn error_kind(&self) -> BackendKind;
}
