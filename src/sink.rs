//! Frame persistence.
//!
//! The session hands every recorded frame to a [`FrameSink`]. The byte layout
//! belongs to the sink; [`EnviSink`] is the default one shipped with the crate.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::traits::{DeviceError, MetadataHeader, RawFrame};

/// On-disk format requested for a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    /// Raw samples plus ENVI text header.
    #[default]
    Envi,
    /// Raw samples only.
    Raw,
}

impl fmt::Display for SaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envi => f.write_str("envi"),
            Self::Raw => f.write_str("raw"),
        }
    }
}

impl FromStr for SaveFormat {
    type Err = SaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "envi" => Ok(Self::Envi),
            "raw" => Ok(Self::Raw),
            other => Err(SaveError::UnknownFormat(other.to_owned())),
        }
    }
}

/// Errors raised by a save capability.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// Target folder does not exist.
    #[error("Save folder does not exist: {}", .0.display())]
    MissingFolder(PathBuf),
    /// Format name not recognised.
    #[error("Unknown save format: {0}")]
    UnknownFormat(String),
    /// Writing a file failed.
    #[error("Failed to write {}: {source}", path.display())]
    Io {
        /// File being written.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Save capability invoked synchronously for every recorded frame.
pub trait FrameSink {
    /// Persist `frame` as `folder/stem.*`. `folder` exists when called.
    fn save(
        &mut self,
        frame: &RawFrame,
        folder: &Path,
        stem: &str,
        header: &MetadataHeader,
        format: SaveFormat,
    ) -> Result<(), SaveError>;
}

/// Writes `<stem>.img` + `<stem>.hdr` (ENVI) or `<stem>.raw` (Raw).
#[derive(Debug, Clone, Copy, Default)]
pub struct EnviSink;

impl FrameSink for EnviSink {
    fn save(
        &mut self,
        frame: &RawFrame,
        folder: &Path,
        stem: &str,
        header: &MetadataHeader,
        format: SaveFormat,
    ) -> Result<(), SaveError> {
        if !folder.is_dir() {
            return Err(SaveError::MissingFolder(folder.to_path_buf()));
        }

        let bytes = frame.samples.to_le_bytes();
        match format {
            SaveFormat::Envi => {
                write_file(&folder.join(format!("{stem}.img")), &bytes)?;
                write_file(
                    &folder.join(format!("{stem}.hdr")),
                    render_envi_header(header).as_bytes(),
                )
            }
            SaveFormat::Raw => write_file(&folder.join(format!("{stem}.raw")), &bytes),
        }
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), SaveError> {
    let io_err = |source| SaveError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::create(path).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)
}

/// Render an ENVI text header.
#[must_use]
pub fn render_envi_header(header: &MetadataHeader) -> String {
    let mut lines = vec![
        "ENVI".to_owned(),
        format!("samples = {}", header.samples),
        format!("lines = {}", header.lines),
        format!("bands = {}", header.bands),
        "header offset = 0".to_owned(),
        format!("interleave = {}", header.interleave),
        format!("byte order = {}", header.byte_order),
        format!("data type = {}", header.data_type),
        format!("bit depth = {} bits", header.bit_depth),
        format!("acquisition time = {}", header.acquisition_time.to_rfc3339()),
    ];
    if let Some(description) = &header.description {
        lines.push(format!("description = {{{description}}}"));
    }
    if let Some(sensor) = &header.sensor_type {
        lines.push(format!("sensor type = {sensor}"));
    }
    if let Some(units) = &header.wavelength_units {
        lines.push(format!("wavelength units = {units}"));
    }
    if !header.wavelengths.is_empty() {
        let list: Vec<String> = header.wavelengths.iter().map(ToString::to_string).collect();
        lines.push(format!("wavelength = {{{}}}", list.join(", ")));
    }
    for (key, value) in &header.extra {
        lines.push(format!("{key} = {value}"));
    }
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// Save root plus the optional subfolder selected for the current recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveLocation {
    root: PathBuf,
    subfolder: Option<String>,
}

impl SaveLocation {
    /// Use `root`, creating it if missing.
    pub fn new(root: PathBuf) -> Result<Self, DeviceError> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            subfolder: None,
        })
    }

    /// Create (if needed) and select `name` directly under the root.
    pub fn set_subfolder(&mut self, name: &str) -> Result<(), DeviceError> {
        let mut components = Path::new(name).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single {
            return Err(DeviceError::InvalidSubfolder(name.to_owned()));
        }

        let path = self.root.join(name);
        if !path.is_dir() {
            fs::create_dir(&path)?;
        }
        self.subfolder = Some(name.to_owned());
        Ok(())
    }

    /// Current save folder.
    #[must_use]
    pub fn folder(&self) -> PathBuf {
        self.subfolder
            .as_ref()
            .map_or_else(|| self.root.clone(), |sub| self.root.join(sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Samples;

    fn frame() -> RawFrame {
        RawFrame {
            height: 2,
            width: 2,
            channels: 1,
            bit_depth: 16,
            sequence: 0,
            samples: Samples::U16(vec![1, 2, 3, 0xffff]),
        }
    }

    #[test]
    fn test_envi_sink_writes_image_and_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let header = MetadataHeader::new((2, 2), 16);
        EnviSink
            .save(&frame(), dir.path(), "frame_0000", &header, SaveFormat::Envi)
            .expect("save should succeed");

        let image = fs::read(dir.path().join("frame_0000.img")).expect("image written");
        assert_eq!(image.len(), 8);
        assert_eq!(&image[6..], &[0xff, 0xff]);

        let text = fs::read_to_string(dir.path().join("frame_0000.hdr")).expect("header written");
        assert!(text.starts_with("ENVI\n"));
        assert!(text.contains("data type = 12"));
        assert!(text.contains("samples = 2"));
    }

    #[test]
    fn test_raw_sink_writes_only_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let header = MetadataHeader::new((2, 2), 16);
        EnviSink
            .save(&frame(), dir.path(), "frame_0001", &header, SaveFormat::Raw)
            .expect("save should succeed");
        assert!(dir.path().join("frame_0001.raw").is_file());
        assert!(!dir.path().join("frame_0001.hdr").exists());
    }

    #[test]
    fn test_sink_rejects_missing_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let header = MetadataHeader::new((2, 2), 16);
        let result = EnviSink.save(&frame(), &missing, "x", &header, SaveFormat::Raw);
        assert!(matches!(result, Err(SaveError::MissingFolder(_))));
    }

    #[test]
    fn test_save_location_subfolder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut location = SaveLocation::new(dir.path().join("mock")).expect("root created");
        assert_eq!(location.folder(), dir.path().join("mock"));

        location.set_subfolder("20240101_120000").expect("subfolder created");
        assert!(location.folder().is_dir());
        assert!(location.folder().ends_with("20240101_120000"));

        // selecting an existing folder again is fine
        location.set_subfolder("20240101_120000").expect("existing subfolder");
    }

    #[test]
    fn test_save_location_rejects_nested_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut location = SaveLocation::new(dir.path().to_path_buf()).expect("root");
        assert!(location.set_subfolder("a/b").is_err());
        assert!(location.set_subfolder("..").is_err());
        assert!(location.set_subfolder("").is_err());
    }

    #[test]
    fn test_save_format_parse() {
        assert_eq!("ENVI".parse::<SaveFormat>().expect("envi"), SaveFormat::Envi);
        assert!("tiff".parse::<SaveFormat>().is_err());
    }
}
