//! Spectra-Cam-Capture: a camera capture core for hyperspectral and video
//! cameras.
//!
//! This library provides a trait-based abstraction over capture backends
//! (simulated, V4L2 monochrome, Bayer-mosaic), a binary-search auto-exposure
//! estimator and a tick-driven capture session that a front-end can drive
//! without touching the devices directly.

pub mod config;
pub mod demosaic;
#[cfg(any(feature = "v4l2", feature = "tis"))]
pub mod device;
pub mod exposure;
pub mod mock;
pub mod registry;
pub mod session;
pub mod sink;
pub mod tis;
pub mod traits;
pub mod validation;

pub use config::{Config, ConfigError};
#[cfg(feature = "v4l2")]
pub use device::V4L2Camera;
pub use exposure::{ExposureEstimator, ExposureSearch, ExposureTuning, SaturationPolicy};
pub use mock::{MockCamera, TestPattern};
pub use session::{CaptureSession, Published, SessionError, TickOutcome};
pub use sink::{EnviSink, FrameSink, SaveError, SaveFormat};
pub use traits::{
    BackendKind, CaptureDevice, DeviceError, DisplayFrame, ExposureRange, MetadataHeader,
    RawFrame, Samples, ViewMode,
};
