//! Node configuration – reads `percept.toml`.
//!
//! The calibration scalars are deliberately **required**: starting the
//! rectification stage without a complete calibration is a fatal
//! misconfiguration, not something to paper over with defaults.  Everything
//! else carries a sensible default.

use chrono::Duration;
use percept_rectify::{
    CachedRemapUndistorter, CalibrationProfile, DistortionCoefficients, Intrinsics,
    ReferenceUndistorter, UndistortAlgorithm,
};
use percept_types::PerceptError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Camera calibration block, matching the parameter layout the calibration
/// tooling emits: 4 intrinsic values, 5 distortion coefficients (3 radial +
/// 2 tangential) and the calibrated frame geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
    pub image_width: u32,
    pub image_height: u32,
    /// Frames stamped closer together than this are dropped.
    #[serde(default = "default_min_frame_interval_ms")]
    pub min_frame_interval_ms: i64,
}

/// Persisted node configuration (`percept.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub camera_calibration: CameraCalibration,

    /// Selects the undistortion variant: `true` for the per-pixel reference
    /// implementation, `false` for the cached-remap one.
    #[serde(default = "default_reference_implementation")]
    pub reference_implementation: bool,

    /// Opaque path handed to the undistortion algorithm.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Per-lane bus queue depth.  1 means only the newest frame matters.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_min_frame_interval_ms() -> i64 {
    10
}
fn default_reference_implementation() -> bool {
    true
}
fn default_config_dir() -> PathBuf {
    PathBuf::from("./config")
}
fn default_channel_capacity() -> usize {
    1
}

/// Load and parse the configuration file.
///
/// # Errors
///
/// Returns [`PerceptError::Config`] when the file is missing, unreadable or
/// malformed – all fatal at startup.
pub fn load(path: &Path) -> Result<NodeConfig, PerceptError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PerceptError::Config(format!("failed to read config at {}: {}", path.display(), e))
    })?;
    let mut cfg: NodeConfig = toml::from_str(&raw)
        .map_err(|e| PerceptError::Config(format!("failed to parse config: {}", e)))?;
    apply_env_overrides(&mut cfg);
    if cfg.channel_capacity == 0 {
        return Err(PerceptError::Config(
            "channel_capacity must be at least 1".to_string(),
        ));
    }
    Ok(cfg)
}

/// Apply `PERCEPT_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `PERCEPT_CONFIG_DIR` | `config_dir` |
/// | `PERCEPT_REFERENCE_IMPL` | `reference_implementation` |
/// | `PERCEPT_CHANNEL_CAPACITY` | `channel_capacity` (ignored if not a positive integer) |
pub fn apply_env_overrides(cfg: &mut NodeConfig) {
    if let Ok(v) = std::env::var("PERCEPT_CONFIG_DIR") {
        cfg.config_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("PERCEPT_REFERENCE_IMPL")
        && let Ok(flag) = v.parse::<bool>()
    {
        cfg.reference_implementation = flag;
    }
    if let Ok(v) = std::env::var("PERCEPT_CHANNEL_CAPACITY")
        && let Ok(capacity) = v.parse::<usize>()
        && capacity > 0
    {
        cfg.channel_capacity = capacity;
    }
}

impl NodeConfig {
    /// Build the immutable [`CalibrationProfile`] from the calibration block.
    pub fn calibration_profile(&self) -> Result<CalibrationProfile, PerceptError> {
        let c = &self.camera_calibration;
        CalibrationProfile::new(
            Intrinsics {
                fx: c.fx,
                fy: c.fy,
                cx: c.cx,
                cy: c.cy,
            },
            DistortionCoefficients {
                k1: c.k1,
                k2: c.k2,
                p1: c.p1,
                p2: c.p2,
                k3: c.k3,
            },
            c.image_width,
            c.image_height,
            Duration::milliseconds(c.min_frame_interval_ms),
        )
    }

    /// Instantiate the configured undistortion variant.
    pub fn algorithm(&self) -> Arc<dyn UndistortAlgorithm> {
        if self.reference_implementation {
            Arc::new(ReferenceUndistorter)
        } else {
            Arc::new(CachedRemapUndistorter::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL_CONFIG: &str = r#"
reference_implementation = false
config_dir = "/var/lib/percept"
channel_capacity = 4

[camera_calibration]
fx = 500.0
fy = 500.0
cx = 320.0
cy = 240.0
k1 = 0.1
k2 = -0.05
k3 = 0.001
p1 = 0.0002
p2 = -0.0003
image_width = 640
image_height = 480
min_frame_interval_ms = 25
"#;

    const MINIMAL_CONFIG: &str = r#"
[camera_calibration]
fx = 500.0
fy = 500.0
cx = 320.0
cy = 240.0
k1 = 0.0
k2 = 0.0
k3 = 0.0
p1 = 0.0
p2 = 0.0
image_width = 640
image_height = 480
"#;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("percept.toml");
        let mut file = std::fs::File::create(&path).expect("create config");
        file.write_all(contents.as_bytes()).expect("write config");
        (dir, path)
    }

    #[test]
    fn full_config_parses() {
        let (_dir, path) = write_config(FULL_CONFIG);
        let cfg = load(&path).expect("load");
        assert!(!cfg.reference_implementation);
        assert_eq!(cfg.config_dir, PathBuf::from("/var/lib/percept"));
        assert_eq!(cfg.channel_capacity, 4);
        assert_eq!(cfg.camera_calibration.min_frame_interval_ms, 25);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let (_dir, path) = write_config(MINIMAL_CONFIG);
        let cfg = load(&path).expect("load");
        assert!(cfg.reference_implementation);
        assert_eq!(cfg.channel_capacity, 1);
        assert_eq!(cfg.camera_calibration.min_frame_interval_ms, 10);
    }

    #[test]
    fn missing_file_is_fatal_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = load(&dir.path().join("absent.toml")).expect_err("must fail");
        assert!(matches!(err, PerceptError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_calibration_scalar_is_fatal() {
        // fx deliberately absent.
        let broken = MINIMAL_CONFIG.replace("fx = 500.0\n", "");
        let (_dir, path) = write_config(&broken);
        let err = load(&path).expect_err("must fail");
        assert!(matches!(err, PerceptError::Config(_)));
    }

    #[test]
    fn profile_carries_coefficients_in_conventional_order() {
        let (_dir, path) = write_config(FULL_CONFIG);
        let cfg = load(&path).expect("load");
        let profile = cfg.calibration_profile().expect("profile");
        assert_eq!(
            profile.distortion().as_vector(),
            [0.1, -0.05, 0.0002, -0.0003, 0.001]
        );
        assert_eq!(profile.expected_width(), 640);
        assert_eq!(profile.expected_height(), 480);
        assert_eq!(profile.min_frame_interval(), Duration::milliseconds(25));
    }

    #[test]
    fn invalid_calibration_values_are_rejected() {
        let broken = MINIMAL_CONFIG.replace("fx = 500.0", "fx = -1.0");
        let (_dir, path) = write_config(&broken);
        let cfg = load(&path).expect("load");
        let err = cfg.calibration_profile().expect_err("must reject");
        assert!(err.is_fatal());
    }

    #[test]
    fn env_override_changes_config_dir() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("PERCEPT_CONFIG_DIR", "/tmp/elsewhere") };
        let (_dir, path) = write_config(MINIMAL_CONFIG);
        let cfg = load(&path).expect("load");
        assert_eq!(cfg.config_dir, PathBuf::from("/tmp/elsewhere"));
        unsafe { std::env::remove_var("PERCEPT_CONFIG_DIR") };
    }

    #[test]
    fn env_override_ignores_zero_capacity() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("PERCEPT_CHANNEL_CAPACITY", "0") };
        let (_dir, path) = write_config(MINIMAL_CONFIG);
        let cfg = load(&path).expect("load");
        assert_eq!(cfg.channel_capacity, 1);
        unsafe { std::env::remove_var("PERCEPT_CHANNEL_CAPACITY") };
    }
}
