//! Camera calibration profile.
//!
//! A [`CalibrationProfile`] is loaded once at startup and never mutated
//! afterwards; it describes one specific lens/sensor combination.  Every
//! incoming frame must match the profile's expected geometry exactly –
//! a mismatch means the camera and the calibration belong to different
//! optical setups and is treated as fatal by the controller.

use chrono::Duration;
use percept_types::PerceptError;

/// Minimum spacing between accepted frames when the configuration does not
/// say otherwise (10 ms, i.e. at most 100 accepted frames per second).
pub const DEFAULT_MIN_FRAME_INTERVAL_MS: i64 = 10;

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    /// Focal length along X, in pixels.
    pub fx: f64,
    /// Focal length along Y, in pixels.
    pub fy: f64,
    /// Principal point X coordinate, in pixels.
    pub cx: f64,
    /// Principal point Y coordinate, in pixels.
    pub cy: f64,
}

impl Intrinsics {
    /// The full 3×3 camera matrix in row-major order.
    pub fn to_matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }
}

/// Brown–Conrady lens distortion coefficients: three radial terms and two
/// tangential terms.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DistortionCoefficients {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl DistortionCoefficients {
    /// All-zero coefficients: an ideal lens with no distortion.
    pub fn zero() -> Self {
        Self::default()
    }

    /// The coefficient vector in the conventional `[k1, k2, p1, p2, k3]`
    /// ordering.
    pub fn as_vector(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }
}

/// Immutable camera-calibration parameters plus the admission-filter
/// rate limit.
///
/// Constructed once via [`CalibrationProfile::new`], which rejects
/// structurally invalid parameters with a fatal
/// [`PerceptError::Config`]; read-only for the rest of the process
/// lifetime.
#[derive(Debug, Clone)]
pub struct CalibrationProfile {
    intrinsics: Intrinsics,
    distortion: DistortionCoefficients,
    expected_width: u32,
    expected_height: u32,
    min_frame_interval: Duration,
}

impl CalibrationProfile {
    /// Build and validate a profile.
    ///
    /// # Errors
    ///
    /// Returns [`PerceptError::Config`] when the focal lengths are not
    /// strictly positive, the expected dimensions are zero, or the minimum
    /// inter-frame interval is negative.  All of these indicate a broken
    /// configuration the controller must not start under.
    pub fn new(
        intrinsics: Intrinsics,
        distortion: DistortionCoefficients,
        expected_width: u32,
        expected_height: u32,
        min_frame_interval: Duration,
    ) -> Result<Self, PerceptError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            return Err(PerceptError::Config(format!(
                "focal lengths must be positive, got fx={} fy={}",
                intrinsics.fx, intrinsics.fy
            )));
        }
        if expected_width == 0 || expected_height == 0 {
            return Err(PerceptError::Config(format!(
                "expected frame dimensions must be positive, got {}x{}",
                expected_width, expected_height
            )));
        }
        if min_frame_interval < Duration::zero() {
            return Err(PerceptError::Config(format!(
                "minimum inter-frame interval must be non-negative, got {} ms",
                min_frame_interval.num_milliseconds()
            )));
        }
        Ok(Self {
            intrinsics,
            distortion,
            expected_width,
            expected_height,
            min_frame_interval,
        })
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub fn distortion(&self) -> &DistortionCoefficients {
        &self.distortion
    }

    pub fn expected_width(&self) -> u32 {
        self.expected_width
    }

    pub fn expected_height(&self) -> u32 {
        self.expected_height
    }

    /// Frames whose capture stamps are closer together than this to the last
    /// accepted frame are dropped by the admission filter.
    pub fn min_frame_interval(&self) -> Duration {
        self.min_frame_interval
    }

    /// Whether a frame's geometry matches the calibrated geometry exactly.
    pub fn matches_shape(&self, width: u32, height: u32) -> bool {
        width == self.expected_width && height == self.expected_height
    }
}
