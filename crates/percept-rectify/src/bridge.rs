//! Wire-frame decode/encode.
//!
//! Turns an [`ImageFrame`] from the bus into a working [`CvImage`] buffer
//! (normalising color encodings to 3-channel BGR, leaving greyscale as a
//! single channel) and re-encodes processed buffers with the original
//! frame's header so downstream consumers see the producer's timestamp and
//! frame id untouched.

use percept_types::{Encoding, FrameHeader, ImageFrame, PerceptError};

/// A decoded, channel-normalised pixel buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CvImage {
    pub width: u32,
    pub height: u32,
    /// 3 for BGR color, 1 for greyscale.
    pub channels: usize,
    /// Interleaved pixel bytes, `width * height * channels` long.
    pub data: Vec<u8>,
}

/// Decode a wire frame into a [`CvImage`].
///
/// Color encodings normalise to BGR byte order; [`Encoding::Mono8`] passes
/// through as a single channel.
///
/// # Errors
///
/// Returns [`PerceptError::Decode`] when the payload length disagrees with
/// the frame's declared geometry and encoding.  This is a recoverable
/// per-frame condition: the caller logs it and drops the frame.
pub fn decode(frame: &ImageFrame) -> Result<CvImage, PerceptError> {
    let expected = frame.expected_len();
    if frame.data.len() != expected {
        return Err(PerceptError::Decode(format!(
            "{}x{} {:?} frame should carry {} bytes but carries {}",
            frame.width,
            frame.height,
            frame.encoding,
            expected,
            frame.data.len()
        )));
    }

    let data = match frame.encoding {
        Encoding::Bgr8 | Encoding::Mono8 => frame.data.clone(),
        Encoding::Rgb8 => {
            // Swap to BGR so every color frame reaches the algorithm in the
            // same byte order.
            let mut bgr = frame.data.clone();
            for px in bgr.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            bgr
        }
    };

    Ok(CvImage {
        width: frame.width,
        height: frame.height,
        channels: frame.encoding.channels(),
        data,
    })
}

/// Re-encode a processed buffer as a wire frame carrying `header`.
///
/// The output encoding tag reflects the normalised channel layout:
/// [`Encoding::Bgr8`] for 3-channel buffers, [`Encoding::Mono8`] for
/// single-channel ones.
///
/// # Errors
///
/// Returns [`PerceptError::Algorithm`] when the buffer's channel count or
/// byte length is inconsistent – the undistortion implementation produced a
/// malformed image.
pub fn encode(image: CvImage, header: &FrameHeader) -> Result<ImageFrame, PerceptError> {
    let encoding = match image.channels {
        3 => Encoding::Bgr8,
        1 => Encoding::Mono8,
        n => {
            return Err(PerceptError::Algorithm(format!(
                "algorithm produced an image with {} channels",
                n
            )));
        }
    };
    let expected = image.width as usize * image.height as usize * image.channels;
    if image.data.len() != expected {
        return Err(PerceptError::Algorithm(format!(
            "algorithm produced {} bytes for a {}x{} {}-channel image (expected {})",
            image.data.len(),
            image.width,
            image.height,
            image.channels,
            expected
        )));
    }
    Ok(ImageFrame {
        header: header.clone(),
        width: image.width,
        height: image.height,
        encoding,
        data: image.data,
    })
}
