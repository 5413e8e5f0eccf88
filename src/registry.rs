//! Backend registry.
//!
//! Each hardware backend is compiled only when its feature is enabled, so a
//! host without one vendor's stack still builds and runs the others.
//! Selecting a backend that was left out fails with
//! [`DeviceError::BackendUnavailable`] instead of silently falling back.

use tracing::info;

use crate::config::DeviceConfig;
use crate::exposure::ExposureTuning;
use crate::mock::MockCamera;
use crate::traits::{BackendKind, CaptureDevice, DeviceError, Result};

/// Build the device for `kind`. The device is returned closed.
pub fn construct(
    kind: BackendKind,
    device: &DeviceConfig,
    tuning: ExposureTuning,
) -> Result<Box<dyn CaptureDevice>> {
    let save_root = device.backend_root(kind);
    info!(backend = %kind, save_root = %save_root.display(), "constructing capture device");

    match kind {
        BackendKind::Mock => Ok(Box::new(
            MockCamera::new(save_root, tuning)?.with_shape(device.height, device.width),
        )),
        #[cfg(feature = "v4l2")]
        BackendKind::V4l2 => Ok(Box::new(crate::device::V4L2Camera::new(
            device.index,
            (device.height, device.width),
            std::time::Duration::from_millis(device.timeout_ms),
            save_root,
            tuning,
        )?)),
        #[cfg(feature = "tis")]
        BackendKind::Tis => Ok(Box::new(
            crate::tis::TisCamera::new(
                crate::tis::V4L2Grabber::new(device.index),
                save_root,
                tuning,
            )?
            .with_timeout(std::time::Duration::from_millis(device.timeout_ms)),
        )),
        #[allow(unreachable_patterns)]
        other => Err(DeviceError::BackendUnavailable(other)),
    }
}

/// Build the device for a backend name such as `"mock"` or `"hardware-b"`.
pub fn construct_named(
    name: &str,
    device: &DeviceConfig,
    tuning: ExposureTuning,
) -> Result<Box<dyn CaptureDevice>> {
    construct(name.parse()?, device, tuning)
}
