use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pixel-encoding tag carried alongside every raw buffer.
///
/// The rectification stage normalises color encodings to 3-channel BGR and
/// leaves single-channel buffers untouched, so consumers only ever see
/// [`Encoding::Bgr8`] or [`Encoding::Mono8`] on the rectified topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// 3-channel, blue-green-red byte order (OpenCV native).
    Bgr8,
    /// 3-channel, red-green-blue byte order.
    Rgb8,
    /// Single-channel greyscale.
    Mono8,
}

impl Encoding {
    /// Whether this encoding carries color (3 channels) rather than a single
    /// luminance channel.
    pub fn is_color(&self) -> bool {
        matches!(self, Encoding::Bgr8 | Encoding::Rgb8)
    }

    /// Number of bytes per pixel.
    pub fn channels(&self) -> usize {
        if self.is_color() { 3 } else { 1 }
    }
}

/// Metadata attached by the frame producer and preserved end-to-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Monotonically increasing sequence number assigned by the producer.
    pub seq: u64,
    /// Identifier of the originating camera frame of reference,
    /// e.g. `"front_camera"`.
    pub frame_id: String,
    /// Capture timestamp attached by the producer.
    pub stamp: DateTime<Utc>,
}

/// A raw or rectified camera frame travelling over the bus.
///
/// Frames are transient: the rectification controller holds one for the
/// duration of a single admission + processing cycle and retains nothing
/// beyond the last accepted capture stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFrame {
    pub header: FrameHeader,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    pub encoding: Encoding,
    /// Raw pixel data, `width * height * encoding.channels()` bytes.
    pub data: Vec<u8>,
}

impl ImageFrame {
    /// The byte length `data` must have for this frame's geometry and
    /// encoding.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.encoding.channels()
    }
}

/// Global error type for the rectification pipeline.
///
/// Variants split into two classes (see the controller docs): recoverable
/// per-frame failures ([`Decode`][PerceptError::Decode],
/// [`Algorithm`][PerceptError::Algorithm]) which are logged and drop a single
/// frame, and fatal conditions
/// ([`Config`][PerceptError::Config],
/// [`CalibrationMismatch`][PerceptError::CalibrationMismatch]) which
/// propagate to process-level failure.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum PerceptError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Calibration mismatch: loaded calibration expects {expected_w}x{expected_h} \
         but the incoming frame is {got_w}x{got_h}"
    )]
    CalibrationMismatch {
        expected_w: u32,
        expected_h: u32,
        got_w: u32,
        got_h: u32,
    },

    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("Undistortion algorithm error: {0}")]
    Algorithm(String),

    #[error("Bus channel error: {0}")]
    Channel(String),
}

impl PerceptError {
    /// Whether this error must take the process down rather than merely
    /// dropping the current frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PerceptError::Config(_) | PerceptError::CalibrationMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(encoding: Encoding) -> ImageFrame {
        ImageFrame {
            header: FrameHeader {
                seq: 7,
                frame_id: "front_camera".to_string(),
                stamp: Utc::now(),
            },
            width: 2,
            height: 2,
            encoding,
            data: vec![0u8; 2 * 2 * encoding.channels()],
        }
    }

    #[test]
    fn encoding_channel_counts() {
        assert_eq!(Encoding::Bgr8.channels(), 3);
        assert_eq!(Encoding::Rgb8.channels(), 3);
        assert_eq!(Encoding::Mono8.channels(), 1);
        assert!(Encoding::Rgb8.is_color());
        assert!(!Encoding::Mono8.is_color());
    }

    #[test]
    fn frame_roundtrip() {
        let frame = make_frame(Encoding::Bgr8);
        let json = serde_json::to_string(&frame).unwrap();
        let back: ImageFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.header, frame.header);
        assert_eq!(back.width, frame.width);
        assert_eq!(back.encoding, frame.encoding);
        assert_eq!(back.data, frame.data);
    }

    #[test]
    fn expected_len_tracks_encoding() {
        assert_eq!(make_frame(Encoding::Bgr8).expected_len(), 12);
        assert_eq!(make_frame(Encoding::Mono8).expected_len(), 4);
    }

    #[test]
    fn error_fatality_classes() {
        assert!(PerceptError::Config("missing fx".into()).is_fatal());
        assert!(
            PerceptError::CalibrationMismatch {
                expected_w: 640,
                expected_h: 480,
                got_w: 1280,
                got_h: 720,
            }
            .is_fatal()
        );
        assert!(!PerceptError::Decode("short buffer".into()).is_fatal());
        assert!(!PerceptError::Algorithm("remap failed".into()).is_fatal());
        assert!(!PerceptError::Channel("closed".into()).is_fatal());
    }

    #[test]
    fn mismatch_display_names_both_resolutions() {
        let err = PerceptError::CalibrationMismatch {
            expected_w: 640,
            expected_h: 480,
            got_w: 1280,
            got_h: 720,
        };
        let msg = err.to_string();
        assert!(msg.contains("640x480"));
        assert!(msg.contains("1280x720"));
    }
}
