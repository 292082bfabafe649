//! Common utilities for skysolve integration tests

#![allow(dead_code)]

use shared::camera_interface::Resolution;
use skysolve::config::{CalibrationConfig, CaptureConfig, ServiceConfig};
use skysolve::Mode;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const FIELD_CENTER_LINE: &str = "Field center: (RA,Dec) = (83.822083, -5.391111) deg.";
pub const FIELD_SIZE_LINE: &str = "Field size: 1.2 x 0.9 degrees";

/// Write an executable `/bin/sh` script standing in for the plate solver.
pub fn fake_solver(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Solver that reports the Orion field and exits cleanly.
pub fn solving_script(dir: &Path) -> PathBuf {
    fake_solver(
        dir,
        "solve-ok.sh",
        &format!(
            "echo 'Reading input file 1 of 1: \"$1\"'\n\
             echo '{FIELD_CENTER_LINE}'\n\
             echo '{FIELD_SIZE_LINE}'\n\
             echo '  The star Betelgeuse (alpha Ori)'"
        ),
    )
}

/// Service configuration with test-friendly timings.
pub fn test_config(dir: &Path, solver: PathBuf, mode: Mode) -> ServiceConfig {
    let mut config = ServiceConfig {
        mode,
        solve_dir: dir.join("solve"),
        capture: CaptureConfig {
            retry_delay: Duration::from_millis(5),
            barrier_timeout: Duration::from_secs(2),
            barrier_attempts: 3,
        },
        calibration: CalibrationConfig {
            settle: Duration::from_millis(50),
        },
        handoff_poll: Duration::from_millis(5),
        ..Default::default()
    };
    config.camera.resolution = Resolution::new(64, 48);
    config.camera.exposure = Duration::from_millis(5);
    config.solver.binary = solver;
    config
}

/// Poll `f` until it holds, failing the test after `timeout`.
pub async fn eventually(timeout: Duration, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !f() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
