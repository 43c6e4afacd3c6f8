//! [`RectifyController`] – subscription lifecycle and frame admission.
//!
//! The controller owns a two-state machine:
//!
//! - `INACTIVE` – no upstream subscription exists.
//! - `ACTIVE` – a pump task forwards raw frames into the admission path.
//!
//! It is `ACTIVE` exactly while the rectified-image lane has at least one
//! downstream subscriber; the check runs on every demand change and is
//! serialised under a single mutex so concurrent notifications cannot race
//! into a double subscribe or a lost unsubscribe.  The mutex covers only the
//! compare-and-toggle, never per-frame work.
//!
//! Frames delivered while `ACTIVE` pass a three-stage admission filter
//! (coarse decimation, shape validation, temporal debounce) before the
//! expensive undistortion call.  Filtered frames publish nothing – the
//! filter is intentional backpressure, not a fault.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use percept_bus::{FrameBus, Topic};
use percept_types::{ImageFrame, PerceptError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge;
use crate::calibration::CalibrationProfile;
use crate::undistort::UndistortAlgorithm;

/// Frames silently skipped between accepted ones by the coarse decimation
/// stage: 3 skipped, 1 admitted.
pub const SKIP_FRAMES: u32 = 3;

/// What became of a single delivered frame.
///
/// Only [`Published`][FrameDisposition::Published] produces output on the
/// bus; every other outcome drops the frame without publishing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Rectified frame and latency sample were published.
    Published,
    /// Dropped by the fixed-cadence frame skipper.
    Decimated,
    /// Dropped because its stamp was too close to the last accepted frame.
    Debounced,
    /// Dropped because the inbound buffer could not be decoded.
    DecodeFailed,
    /// Dropped because the undistortion algorithm returned an error.
    AlgorithmFailed,
}

/// Rate-filter state, touched only on the frame path.
struct AdmissionState {
    skip_counter: u32,
    last_accepted: Option<DateTime<Utc>>,
}

struct ControllerInner {
    bus: FrameBus,
    profile: CalibrationProfile,
    algorithm: Arc<dyn UndistortAlgorithm>,
    config_dir: PathBuf,
    /// `Some` ⇔ ACTIVE.  Guards the subscribe/teardown toggle only.
    upstream: Mutex<Option<JoinHandle<()>>>,
    admission: Mutex<AdmissionState>,
    fault_tx: mpsc::UnboundedSender<PerceptError>,
}

/// Demand-driven rectification stage.  See the module docs for the state
/// machine; see [`RectifyController::handle_frame`] for the per-frame
/// pipeline.
pub struct RectifyController {
    inner: Arc<ControllerInner>,
    fault_rx: mpsc::UnboundedReceiver<PerceptError>,
}

impl RectifyController {
    /// Create a controller in the `INACTIVE` state.
    ///
    /// The algorithm is injected here so tests can drive the controller with
    /// identity or error-raising stubs and no transport beyond the in-process
    /// bus.
    pub fn new(
        bus: FrameBus,
        profile: CalibrationProfile,
        algorithm: Arc<dyn UndistortAlgorithm>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ControllerInner {
                bus,
                profile,
                algorithm,
                config_dir: config_dir.into(),
                upstream: Mutex::new(None),
                admission: Mutex::new(AdmissionState {
                    skip_counter: 0,
                    last_accepted: None,
                }),
                fault_tx,
            }),
            fault_rx,
        }
    }

    /// Whether the upstream subscription currently exists.
    pub fn is_active(&self) -> bool {
        self.inner.upstream.lock().is_some()
    }

    /// Re-evaluate the lifecycle invariant: `ACTIVE` iff the rectified lane
    /// has downstream subscribers.
    ///
    /// Idempotent – calling it twice with no intervening demand change
    /// performs no action the second time.  Must run inside a tokio runtime
    /// (the pump is a spawned task).
    pub fn refresh_subscription(&self) {
        ControllerInner::refresh_subscription(&self.inner);
    }

    /// Run one frame through admission and processing.
    ///
    /// This is the frame-arrival callback; the pump task calls it for every
    /// raw frame while `ACTIVE`.  Recoverable failures are logged and
    /// reported in the returned [`FrameDisposition`]; the only `Err` is the
    /// fatal calibration mismatch.
    pub fn handle_frame(&self, frame: ImageFrame) -> Result<FrameDisposition, PerceptError> {
        self.inner.handle_frame(frame)
    }

    /// Drive the controller until the bus disappears or a fatal fault is
    /// raised on the frame path.
    ///
    /// Re-runs the lifecycle check exactly when the rectified lane's
    /// subscriber count changes.  Returns `Err` for fatal faults
    /// (calibration mismatch); the caller is expected to treat that as a
    /// process-level failure.
    pub async fn run(&mut self) -> Result<(), PerceptError> {
        let mut demand = self.inner.bus.demand_watch(Topic::RectifiedImage);
        loop {
            ControllerInner::refresh_subscription(&self.inner);
            tokio::select! {
                changed = demand.changed() => {
                    if changed.is_err() {
                        // Bus dropped; nothing left to serve.
                        self.inner.shutdown();
                        return Ok(());
                    }
                }
                fault = self.fault_rx.recv() => {
                    self.inner.shutdown();
                    return match fault {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
            }
        }
    }
}

impl Drop for RectifyController {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl ControllerInner {
    fn refresh_subscription(this: &Arc<Self>) {
        let mut upstream = this.upstream.lock();
        let demand = this.bus.subscriber_count(Topic::RectifiedImage);

        if demand == 0 {
            if let Some(pump) = upstream.take() {
                pump.abort();
                info!("rectified lane has no subscribers, upstream subscription closed");
            }
        } else if upstream.is_none() {
            let mut raw = this.bus.subscribe_frames(Topic::RawImage);
            let inner = Arc::clone(this);
            let pump = tokio::spawn(async move {
                while let Some(frame) = raw.recv_latest().await {
                    match inner.handle_frame(frame) {
                        Ok(disposition) => {
                            debug!(?disposition, "frame handled");
                        }
                        Err(fault) => {
                            error!(%fault, "fatal fault on frame path");
                            let _ = inner.fault_tx.send(fault);
                            return;
                        }
                    }
                }
            });
            *upstream = Some(pump);
            info!(subscribers = demand, "downstream demand present, upstream subscription opened");
        }
        // Demand changed without crossing the 0/non-zero boundary: no-op.
    }

    fn shutdown(&self) {
        if let Some(pump) = self.upstream.lock().take() {
            pump.abort();
        }
    }

    fn handle_frame(&self, frame: ImageFrame) -> Result<FrameDisposition, PerceptError> {
        // ── Admission filter ───────────────────────────────────────────────
        {
            let mut admission = self.admission.lock();

            // 1. Coarse decimation: fixed cadence, independent of stamps.
            if admission.skip_counter < SKIP_FRAMES {
                admission.skip_counter += 1;
                return Ok(FrameDisposition::Decimated);
            }
            admission.skip_counter = 0;

            // 2. Shape validation: calibration and camera must agree.
            if !self.profile.matches_shape(frame.width, frame.height) {
                return Err(PerceptError::CalibrationMismatch {
                    expected_w: self.profile.expected_width(),
                    expected_h: self.profile.expected_height(),
                    got_w: frame.width,
                    got_h: frame.height,
                });
            }

            // 3. Temporal debounce: |Δt| to the last accepted frame must
            // reach the configured minimum.  Also catches out-of-order and
            // duplicate delivery regardless of decimation phase.
            if let Some(last) = admission.last_accepted {
                let delta = (frame.header.stamp - last).abs();
                if delta < self.profile.min_frame_interval() {
                    return Ok(FrameDisposition::Debounced);
                }
            }
            admission.last_accepted = Some(frame.header.stamp);
        }

        // ── Processing (admission lock released) ───────────────────────────
        let image = match bridge::decode(&frame) {
            Ok(image) => image,
            Err(err) => {
                warn!(seq = frame.header.seq, %err, "dropping undecodable frame");
                return Ok(FrameDisposition::DecodeFailed);
            }
        };

        let started = Instant::now();
        let corrected = self
            .algorithm
            .undistort(&image, &self.profile, &self.config_dir)
            .and_then(|out| bridge::encode(out, &frame.header));
        let rectified = match corrected {
            Ok(rectified) => rectified,
            Err(err) => {
                error!(seq = frame.header.seq, %err, "undistortion failed, dropping frame");
                return Ok(FrameDisposition::AlgorithmFailed);
            }
        };
        let elapsed = started.elapsed().as_secs_f32();

        // Latency sample first, then the image, matching the upstream
        // publication order consumers rely on.
        if let Err(err) = self.bus.publish_process_time(elapsed) {
            warn!(%err, "failed to publish process-time sample");
        }
        if let Err(err) = self.bus.publish_frame(Topic::RectifiedImage, rectified) {
            warn!(%err, "failed to publish rectified frame");
        }
        debug!(seq = frame.header.seq, elapsed_s = elapsed, "frame rectified");

        Ok(FrameDisposition::Published)
    }
}
