//! Frame validation utilities.
//!
//! Checks that captured frames are well-formed and carry the expected test
//! patterns. Used by the integration tests against virtual cameras.

use crate::traits::{DisplayFrame, RawFrame, Samples};

/// Minimum rise across a row for [`validate_gradient`].
const MIN_GRADIENT_RISE: f32 = 0.2;

/// A frame failed validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Buffer length does not match `height * width * channels`.
    #[error("Expected {expected} samples, got {actual}")]
    BufferSize {
        /// `height * width * channels`.
        expected: usize,
        /// Samples present.
        actual: usize,
    },
    /// Frame shape differs from the requested one.
    #[error("Expected shape {expected:?}, got {actual:?}")]
    Shape {
        /// Requested `(height, width)`.
        expected: (u32, u32),
        /// Delivered `(height, width)`.
        actual: (u32, u32),
    },
    /// Sample storage does not match the declared bit depth.
    #[error("Bit depth {0} does not match sample storage")]
    BitDepth(u8),
    /// A display value lies outside `[0, 1]`.
    #[error("Display value {value} at index {index} outside [0, 1]")]
    DisplayRange {
        /// Flat index.
        index: usize,
        /// Offending value.
        value: f32,
    },
    /// Pattern check failed.
    #[error("{0}")]
    Pattern(String),
    /// Sequence numbers skip or repeat.
    #[error("Frame sequence gap at index {index}: expected {expected}, got {actual}")]
    SequenceGap {
        /// Position in the slice.
        index: usize,
        /// Previous + 1.
        expected: u64,
        /// Actual.
        actual: u64,
    },
    /// Nothing to validate.
    #[error("Cannot validate empty frame sequence")]
    Empty,
}

/// Validates that a raw frame has the expected shape and a consistent buffer.
///
/// # Errors
///
/// Returns an error if the shape differs from `expected_shape`, the buffer
/// length is not `height * width * channels`, or the sample storage does not
/// fit the bit depth.
pub fn validate_raw_frame(
    frame: &RawFrame,
    expected_shape: (u32, u32),
) -> Result<(), ValidationError> {
    if frame.shape() != expected_shape {
        return Err(ValidationError::Shape {
            expected: expected_shape,
            actual: frame.shape(),
        });
    }

    let expected = frame.expected_len();
    if frame.samples.len() != expected {
        return Err(ValidationError::BufferSize {
            expected,
            actual: frame.samples.len(),
        });
    }

    let storage_fits = match frame.samples {
        Samples::U8(_) => frame.bit_depth <= 8,
        Samples::U16(_) => frame.bit_depth > 8 && frame.bit_depth <= 16,
    };
    if !storage_fits {
        return Err(ValidationError::BitDepth(frame.bit_depth));
    }
    Ok(())
}

/// Validates that a display frame is complete and normalized.
///
/// # Errors
///
/// Returns an error if the buffer length is wrong or any value lies outside
/// `[0, 1]`.
pub fn validate_display_frame(frame: &DisplayFrame) -> Result<(), ValidationError> {
    let expected = frame.height as usize * frame.width as usize * frame.channels as usize;
    if frame.data.len() != expected {
        return Err(ValidationError::BufferSize {
            expected,
            actual: frame.data.len(),
        });
    }
    if let Some((index, &value)) = frame
        .data
        .iter()
        .enumerate()
        .find(|(_, v)| !(0.0..=1.0).contains(*v))
    {
        return Err(ValidationError::DisplayRange { index, value });
    }
    Ok(())
}

/// Validates that a display frame holds a left-to-right brightening ramp.
///
/// Samples the center row every 10 pixels; each sample must not fall below
/// the previous one and the row must rise noticeably overall.
///
/// # Errors
///
/// Returns [`ValidationError::Pattern`] if the row decreases or is flat.
pub fn validate_gradient(frame: &DisplayFrame) -> Result<(), ValidationError> {
    let center_y = frame.height / 2;
    let mut first: Option<f32> = None;
    let mut prev: Option<f32> = None;

    for x in (0..frame.width).step_by(10) {
        let value = frame.value_at(x, center_y, 0).ok_or_else(|| {
            ValidationError::Pattern(format!("Failed to get value at ({x}, {center_y})"))
        })?;
        if let Some(prev) = prev {
            if value + 1e-6 < prev {
                return Err(ValidationError::Pattern(format!(
                    "Gradient decreases at x={x}: {value} < previous {prev}"
                )));
            }
        }
        first.get_or_insert(value);
        prev = Some(value);
    }

    let rise = prev.unwrap_or_default() - first.unwrap_or_default();
    if rise < MIN_GRADIENT_RISE {
        return Err(ValidationError::Pattern(format!(
            "Insufficient rise for gradient: {rise} (expected at least {MIN_GRADIENT_RISE})"
        )));
    }
    Ok(())
}

/// Finds the first column of the center row at or above `level` (normalized).
#[must_use]
pub fn find_bright_column(frame: &DisplayFrame, level: f32) -> Option<u32> {
    let center_y = frame.height / 2;
    (0..frame.width).find(|&x| frame.value_at(x, center_y, 0).is_some_and(|v| v >= level))
}

/// Validates that a sequence of frames has incrementing sequence numbers.
///
/// # Errors
///
/// Returns an error if the slice is empty or any sequence number does not
/// increment by exactly 1 from the previous.
pub fn validate_frame_sequence(frames: &[RawFrame]) -> Result<(), ValidationError> {
    if frames.is_empty() {
        return Err(ValidationError::Empty);
    }
    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.sequence + 1;
            if curr.sequence != expected {
                return Err(ValidationError::SequenceGap {
                    index: index + 1,
                    expected,
                    actual: curr.sequence,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::ExposureTuning;
    use crate::mock::{MockCamera, TestPattern};
    use crate::traits::CaptureDevice;

    fn camera(dir: &tempfile::TempDir, pattern: TestPattern) -> MockCamera {
        let mut camera = MockCamera::new(dir.path().to_path_buf(), ExposureTuning::default())
            .expect("camera")
            .with_pattern(pattern);
        camera.open().expect("open");
        camera
    }

    #[test]
    fn test_validate_raw_frame_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut camera = camera(&dir, TestPattern::MovingBar);
        let (raw, display) = camera.get_frame(30.0).expect("frame");
        assert!(validate_raw_frame(&raw, (480, 640)).is_ok());
        assert!(validate_display_frame(&display).is_ok());
    }

    #[test]
    fn test_validate_raw_frame_wrong_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut camera = camera(&dir, TestPattern::Ramp);
        let (raw, _) = camera.get_frame(30.0).expect("frame");
        assert!(matches!(
            validate_raw_frame(&raw, (240, 320)),
            Err(ValidationError::Shape { .. })
        ));
    }

    #[test]
    fn test_validate_raw_frame_truncated() {
        let frame = RawFrame {
            height: 2,
            width: 2,
            channels: 1,
            bit_depth: 16,
            sequence: 0,
            samples: Samples::U16(vec![0; 3]),
        };
        assert_eq!(
            validate_raw_frame(&frame, (2, 2)),
            Err(ValidationError::BufferSize {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_validate_raw_frame_large_shape() {
        // 70000 * 70000 does not fit in u32
        let frame = RawFrame {
            height: 70_000,
            width: 70_000,
            channels: 1,
            bit_depth: 8,
            sequence: 0,
            samples: Samples::U8(Vec::new()),
        };
        assert_eq!(
            validate_raw_frame(&frame, (70_000, 70_000)),
            Err(ValidationError::BufferSize {
                expected: 4_900_000_000,
                actual: 0
            })
        );
    }

    #[test]
    fn test_validate_display_out_of_range() {
        let frame = DisplayFrame {
            height: 1,
            width: 2,
            channels: 1,
            data: vec![0.5, 1.5],
        };
        assert!(matches!(
            validate_display_frame(&frame),
            Err(ValidationError::DisplayRange { index: 1, .. })
        ));
    }

    #[test]
    fn test_validate_gradient_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut camera = camera(&dir, TestPattern::Ramp);
        let (_, display) = camera.get_frame(30.0).expect("frame");
        let result = validate_gradient(&display);
        assert!(result.is_ok(), "Gradient validation should succeed: {result:?}");
    }

    #[test]
    fn test_validate_gradient_wrong_pattern() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut camera = camera(&dir, TestPattern::Solid(0.5));
        let (_, display) = camera.get_frame(30.0).expect("frame");
        assert!(validate_gradient(&display).is_err());
    }

    #[test]
    fn test_bright_column_follows_bar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut camera = camera(&dir, TestPattern::MovingBar);
        let (_, first) = camera.get_frame(30.0).expect("frame");
        let (_, second) = camera.get_frame(30.0).expect("frame");
        assert_eq!(find_bright_column(&first, 0.7), Some(0));
        assert_eq!(find_bright_column(&second, 0.7), Some(1));
    }

    #[test]
    fn test_validate_frame_sequence_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut camera = camera(&dir, TestPattern::Ramp);
        let frames: Vec<RawFrame> = (0..5)
            .map(|_| camera.get_frame(30.0).expect("frame").0)
            .collect();
        assert!(validate_frame_sequence(&frames).is_ok());
    }

    #[test]
    fn test_validate_frame_sequence_empty() {
        assert_eq!(validate_frame_sequence(&[]), Err(ValidationError::Empty));
    }

    #[test]
    fn test_validate_frame_sequence_with_gap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut camera = camera(&dir, TestPattern::Ramp);
        let mut frames = vec![
            camera.get_frame(30.0).expect("frame").0,
            camera.get_frame(30.0).expect("frame").0,
        ];
        let _ = camera.get_frame(30.0).expect("frame");
        frames.push(camera.get_frame(30.0).expect("frame").0);
        assert!(matches!(
            validate_frame_sequence(&frames),
            Err(ValidationError::SequenceGap { index: 2, .. })
        ));
    }
}
