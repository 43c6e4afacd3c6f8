//! `percept-node` – process entry point for the rectification stage.
//!
//! Boot sequence:
//!
//! 1. Initialise structured logging from `RUST_LOG`
//!    (`PERCEPT_LOG_FORMAT=json` switches to newline-delimited JSON).
//! 2. Load `percept.toml` (path from the first argument or
//!    `PERCEPT_CONFIG`); a missing or incomplete calibration is fatal.
//! 3. Build the frame bus, the calibration profile and the configured
//!    undistortion variant, then hand them to the
//!    [`RectifyController`][percept_rectify::RectifyController].
//! 4. Run until Ctrl-C or a fatal fault; exit non-zero on fault.
//!
//! The camera driver and downstream consumers attach to the same
//! [`FrameBus`] by cloning it into their own stages; this binary hosts only
//! the rectification stage itself.

mod config;

use percept_bus::FrameBus;
use percept_rectify::RectifyController;
use percept_types::PerceptError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // ── Structured logging ────────────────────────────────────────────────
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("PERCEPT_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PERCEPT_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("percept.toml"));

    match run(&config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "rectification stage failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_path: &std::path::Path) -> Result<(), PerceptError> {
    let cfg = config::load(config_path)?;
    let profile = cfg.calibration_profile()?;

    info!(
        camera_matrix = ?profile.intrinsics().to_matrix(),
        dist_coeffs = ?profile.distortion().as_vector(),
        expected = %format!("{}x{}", profile.expected_width(), profile.expected_height()),
        "calibration loaded"
    );
    info!(
        reference_implementation = cfg.reference_implementation,
        config_dir = %cfg.config_dir.display(),
        "undistortion variant selected"
    );

    let bus = FrameBus::new(cfg.channel_capacity);
    let mut controller =
        RectifyController::new(bus.clone(), profile, cfg.algorithm(), cfg.config_dir.clone());

    tokio::select! {
        result = controller.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}
