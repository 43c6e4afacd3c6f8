//! `percept-rectify` – demand-driven image rectification stage.
//!
//! Receives raw camera frames over the [`percept_bus::FrameBus`], removes
//! lens distortion using a precomputed calibration profile, and republishes
//! the corrected frame together with a per-frame processing-latency sample.
//!
//! # Modules
//!
//! - [`calibration`] – [`CalibrationProfile`][calibration::CalibrationProfile]:
//!   immutable camera intrinsics, distortion coefficients, expected frame
//!   geometry and the rate-limit interval.
//! - [`bridge`] – decodes wire [`ImageFrame`][percept_types::ImageFrame]s
//!   into working pixel buffers (normalising color to BGR) and re-encodes
//!   results with the original header.
//! - [`undistort`] – the pluggable
//!   [`UndistortAlgorithm`][undistort::UndistortAlgorithm] seam plus the two
//!   production implementations.
//! - [`controller`] – [`RectifyController`][controller::RectifyController]:
//!   the subscription-lifecycle state machine and frame-admission filter.

pub mod bridge;
pub mod calibration;
pub mod controller;
pub mod undistort;

pub use calibration::{CalibrationProfile, DistortionCoefficients, Intrinsics};
pub use controller::{FrameDisposition, RectifyController};
pub use undistort::{CachedRemapUndistorter, ReferenceUndistorter, UndistortAlgorithm};
