//! Configuration file handling.
//!
//! Loads `~/.config/spectra-cam-capture/config.toml` or a custom path. Every
//! field has a default, so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::exposure::{ExposureTuning, SaturationPolicy, DEFAULT_MAX_TRIES};
use crate::sink::SaveFormat;
use crate::traits::BackendKind;

const APP_DIR: &str = "spectra-cam-capture";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session defaults.
    pub session: SessionConfig,
    /// Device construction parameters.
    pub device: DeviceConfig,
    /// Auto-exposure tuning.
    pub exposure: ExposureConfig,
}

/// `[session]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend selected at startup.
    pub backend: BackendKind,
    /// Target frame rate.
    pub fps: f64,
    /// Recorded files are named `<filename_stem>_NNNN`.
    pub filename_stem: String,
    /// Format handed to the sink.
    pub recording_format: SaveFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Mock,
            fps: 30.0,
            filename_stem: "frame".to_owned(),
            recording_format: SaveFormat::Envi,
        }
    }
}

/// `[device]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Each backend saves under `<save_root>/<backend>`.
    pub save_root: PathBuf,
    /// `/dev/video<index>` for V4L2-based backends.
    pub index: u32,
    /// Frame wait in milliseconds.
    pub timeout_ms: u64,
    /// Requested width.
    pub width: u32,
    /// Requested height.
    pub height: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            save_root: default_save_root(),
            index: 0,
            timeout_ms: 10_000,
            width: 640,
            height: 480,
        }
    }
}

impl DeviceConfig {
    /// Save root for one backend.
    #[must_use]
    pub fn backend_root(&self, kind: BackendKind) -> PathBuf {
        self.save_root.join(kind.name())
    }
}

/// `[exposure]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Target for 8-bit frames.
    pub eight_bit: SaturationPolicy,
    /// Target for 16-bit frames.
    pub sixteen_bit: SaturationPolicy,
    /// Interval width (native units) below which the search stops.
    pub min_interval: u32,
    /// Midpoint drift, in steps, below which the search stops.
    pub step_window: u32,
    /// Ticks before a run is abandoned.
    pub max_tries: u32,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        let tuning = ExposureTuning::default();
        Self {
            eight_bit: tuning.eight_bit,
            sixteen_bit: tuning.sixteen_bit,
            min_interval: tuning.min_interval,
            step_window: tuning.step_window,
            max_tries: DEFAULT_MAX_TRIES,
        }
    }
}

impl ExposureConfig {
    /// Tuning handed to backends.
    #[must_use]
    pub const fn tuning(&self) -> ExposureTuning {
        ExposureTuning {
            eight_bit: self.eight_bit,
            sixteen_bit: self.sixteen_bit,
            min_interval: self.min_interval,
            step_window: self.step_window,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or the default location.
    ///
    /// Returns the default config if the file doesn't exist and an error if it
    /// exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(default_path, Path::to_path_buf);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File exists but could not be read.
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// File is not valid TOML for [`Config`].
    #[error("Failed to parse config file '{}': {source}", path.display())]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
}

/// Default config file path.
#[must_use]
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(APP_DIR)
        .join("config.toml")
}

fn default_save_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}
