//! Pluggable undistortion algorithms.
//!
//! The controller is indifferent to which implementation is active; it only
//! sees the single-method [`UndistortAlgorithm`] seam, injected at
//! construction time.  Two production variants exist:
//!
//! - [`ReferenceUndistorter`] computes the inverse distortion mapping per
//!   pixel on every frame.
//! - [`CachedRemapUndistorter`] computes the same mapping once, stores it as
//!   a lookup table and replays it for every subsequent frame of the same
//!   geometry.
//!
//! Both use the Brown–Conrady model: for each *undistorted* output pixel the
//! corresponding source position in the distorted input is
//!
//! ```text
//! x = (u − cx) / fx          y = (v − cy) / fy
//! r² = x² + y²
//! radial = 1 + k1·r² + k2·r⁴ + k3·r⁶
//! x' = x·radial + 2·p1·x·y + p2·(r² + 2·x²)
//! y' = y·radial + p1·(r² + 2·y²) + 2·p2·x·y
//! src = (fx·x' + cx, fy·y' + cy)
//! ```
//!
//! With all coefficients zero the mapping is the identity.  Sampling is
//! nearest-neighbour; source positions outside the input are written as
//! black.

use crate::bridge::CvImage;
use crate::calibration::CalibrationProfile;
use parking_lot::Mutex;
use percept_types::PerceptError;
use std::path::Path;
use tracing::debug;

/// A lens-undistortion implementation.
///
/// # Contract
///
/// Given an input image and the calibration profile, produce the corrected
/// image.  `config_dir` is an opaque filesystem path handed through from the
/// node configuration; implementations may use it to persist or load
/// auxiliary artifacts.  Any error is treated by the caller as "drop this
/// frame": nothing is published and the controller keeps running.
pub trait UndistortAlgorithm: Send + Sync {
    fn undistort(
        &self,
        image: &CvImage,
        profile: &CalibrationProfile,
        config_dir: &Path,
    ) -> Result<CvImage, PerceptError>;
}

/// Source position in the distorted input for an undistorted output pixel.
fn source_position(profile: &CalibrationProfile, u: f64, v: f64) -> (f64, f64) {
    let i = profile.intrinsics();
    let d = profile.distortion();

    let x = (u - i.cx) / i.fx;
    let y = (v - i.cy) / i.fy;
    let r2 = x * x + y * y;
    let radial = 1.0 + d.k1 * r2 + d.k2 * r2 * r2 + d.k3 * r2 * r2 * r2;
    let xd = x * radial + 2.0 * d.p1 * x * y + d.p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + d.p1 * (r2 + 2.0 * y * y) + 2.0 * d.p2 * x * y;

    (i.fx * xd + i.cx, i.fy * yd + i.cy)
}

/// Nearest-neighbour source pixel index, or `None` when the position falls
/// outside the input image.
fn source_index(width: u32, height: u32, sx: f64, sy: f64) -> Option<usize> {
    let px = sx.round();
    let py = sy.round();
    if px < 0.0 || py < 0.0 || px >= width as f64 || py >= height as f64 {
        return None;
    }
    Some(py as usize * width as usize + px as usize)
}

fn validate_input(image: &CvImage) -> Result<(), PerceptError> {
    let expected = image.width as usize * image.height as usize * image.channels;
    if image.data.len() != expected {
        return Err(PerceptError::Algorithm(format!(
            "input buffer is {} bytes, expected {} for {}x{} with {} channels",
            image.data.len(),
            expected,
            image.width,
            image.height,
            image.channels
        )));
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────────────
// Reference implementation
// ───────────────────────────────────────────────────────────────────────────

/// Direct per-pixel undistortion.  No state, no caching; every frame pays
/// the full cost of evaluating the distortion model.
#[derive(Debug, Default)]
pub struct ReferenceUndistorter;

impl UndistortAlgorithm for ReferenceUndistorter {
    fn undistort(
        &self,
        image: &CvImage,
        profile: &CalibrationProfile,
        _config_dir: &Path,
    ) -> Result<CvImage, PerceptError> {
        validate_input(image)?;

        let mut out = vec![0u8; image.data.len()];
        for v in 0..image.height {
            for u in 0..image.width {
                let (sx, sy) = source_position(profile, u as f64, v as f64);
                if let Some(src) = source_index(image.width, image.height, sx, sy) {
                    let dst = (v as usize * image.width as usize + u as usize) * image.channels;
                    let src = src * image.channels;
                    out[dst..dst + image.channels]
                        .copy_from_slice(&image.data[src..src + image.channels]);
                }
            }
        }

        Ok(CvImage {
            width: image.width,
            height: image.height,
            channels: image.channels,
            data: out,
        })
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Cached-remap implementation
// ───────────────────────────────────────────────────────────────────────────

/// One source-pixel index per output pixel; `None` marks out-of-bounds
/// positions that render as black.
struct RemapTable {
    width: u32,
    height: u32,
    map: Vec<Option<u32>>,
}

impl RemapTable {
    fn build(profile: &CalibrationProfile, width: u32, height: u32) -> Self {
        let mut map = Vec::with_capacity(width as usize * height as usize);
        for v in 0..height {
            for u in 0..width {
                let (sx, sy) = source_position(profile, u as f64, v as f64);
                map.push(source_index(width, height, sx, sy).map(|i| i as u32));
            }
        }
        Self { width, height, map }
    }
}

/// Undistorter that evaluates the distortion model once and replays the
/// resulting lookup table on every frame.
///
/// The table is built lazily on the first frame and rebuilt only when the
/// frame geometry changes (which the controller's shape validation prevents
/// in practice).
#[derive(Default)]
pub struct CachedRemapUndistorter {
    table: Mutex<Option<RemapTable>>,
}

impl CachedRemapUndistorter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UndistortAlgorithm for CachedRemapUndistorter {
    fn undistort(
        &self,
        image: &CvImage,
        profile: &CalibrationProfile,
        _config_dir: &Path,
    ) -> Result<CvImage, PerceptError> {
        validate_input(image)?;

        let mut slot = self.table.lock();
        if slot
            .as_ref()
            .is_some_and(|t| t.width != image.width || t.height != image.height)
        {
            *slot = None;
        }
        let table = slot.get_or_insert_with(|| {
            debug!(
                width = image.width,
                height = image.height,
                "building undistortion remap table"
            );
            RemapTable::build(profile, image.width, image.height)
        });

        let mut out = vec![0u8; image.data.len()];
        for (dst, src) in table.map.iter().enumerate() {
            if let Some(src) = src {
                let dst = dst * image.channels;
                let src = *src as usize * image.channels;
                out[dst..dst + image.channels]
                    .copy_from_slice(&image.data[src..src + image.channels]);
            }
        }

        Ok(CvImage {
            width: image.width,
            height: image.height,
            channels: image.channels,
            data: out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{DistortionCoefficients, Intrinsics};
    use chrono::Duration;

    fn profile_with(distortion: DistortionCoefficients, w: u32, h: u32) -> CalibrationProfile {
        CalibrationProfile::new(
            Intrinsics {
                fx: 10.0,
                fy: 10.0,
                cx: w as f64 / 2.0,
                cy: h as f64 / 2.0,
            },
            distortion,
            w,
            h,
            Duration::milliseconds(10),
        )
        .expect("valid profile")
    }

    fn gradient_image(w: u32, h: u32, channels: usize) -> CvImage {
        let data = (0..w as usize * h as usize * channels)
            .map(|i| (i % 251) as u8)
            .collect();
        CvImage {
            width: w,
            height: h,
            channels,
            data,
        }
    }

    #[test]
    fn zero_distortion_is_identity() {
        let profile = profile_with(DistortionCoefficients::zero(), 8, 6);
        let image = gradient_image(8, 6, 1);
        let out = ReferenceUndistorter
            .undistort(&image, &profile, Path::new("/tmp"))
            .unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn zero_distortion_identity_holds_for_color() {
        let profile = profile_with(DistortionCoefficients::zero(), 4, 4);
        let image = gradient_image(4, 4, 3);
        let out = ReferenceUndistorter
            .undistort(&image, &profile, Path::new("/tmp"))
            .unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn barrel_distortion_moves_pixels() {
        // Short focal length so normalised radii reach ~1 and the radial
        // term displaces edge pixels by whole pixel widths.
        let distortion = DistortionCoefficients {
            k1: -0.3,
            ..DistortionCoefficients::zero()
        };
        let profile = CalibrationProfile::new(
            Intrinsics {
                fx: 8.0,
                fy: 8.0,
                cx: 8.0,
                cy: 8.0,
            },
            distortion,
            16,
            16,
            Duration::milliseconds(10),
        )
        .expect("valid profile");
        let image = gradient_image(16, 16, 1);
        let out = ReferenceUndistorter
            .undistort(&image, &profile, Path::new("/tmp"))
            .unwrap();
        assert_ne!(out.data, image.data);
        assert_eq!(out.width, 16);
        assert_eq!(out.data.len(), image.data.len());
    }

    #[test]
    fn cached_matches_reference() {
        let distortion = DistortionCoefficients {
            k1: 0.8,
            k2: -0.05,
            p1: 0.01,
            p2: -0.02,
            k3: 0.0,
        };
        let profile = profile_with(distortion, 12, 10);
        let image = gradient_image(12, 10, 3);

        let reference = ReferenceUndistorter
            .undistort(&image, &profile, Path::new("/tmp"))
            .unwrap();
        let cached_impl = CachedRemapUndistorter::new();
        let first = cached_impl
            .undistort(&image, &profile, Path::new("/tmp"))
            .unwrap();
        // Second call exercises the cached table.
        let second = cached_impl
            .undistort(&image, &profile, Path::new("/tmp"))
            .unwrap();

        assert_eq!(first, reference);
        assert_eq!(second, reference);
    }

    #[test]
    fn cached_rebuilds_on_geometry_change() {
        let profile_small = profile_with(DistortionCoefficients::zero(), 4, 4);
        let profile_large = profile_with(DistortionCoefficients::zero(), 6, 6);
        let cached = CachedRemapUndistorter::new();

        let small = gradient_image(4, 4, 1);
        let large = gradient_image(6, 6, 1);

        let out_small = cached
            .undistort(&small, &profile_small, Path::new("/tmp"))
            .unwrap();
        let out_large = cached
            .undistort(&large, &profile_large, Path::new("/tmp"))
            .unwrap();

        assert_eq!(out_small, small);
        assert_eq!(out_large, large);
    }

    #[test]
    fn inconsistent_buffer_is_algorithm_error() {
        let profile = profile_with(DistortionCoefficients::zero(), 4, 4);
        let broken = CvImage {
            width: 4,
            height: 4,
            channels: 1,
            data: vec![0; 3],
        };
        let err = ReferenceUndistorter
            .undistort(&broken, &profile, Path::new("/tmp"))
            .expect_err("must fail");
        assert!(matches!(err, PerceptError::Algorithm(_)));
    }
}
