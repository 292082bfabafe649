use crate::state::Mode;
use serde::{Deserialize, Serialize};
use shared::camera_interface::{CaptureProfile, Control, ImageFormat, Resolution};
use std::path::PathBuf;
use std::time::Duration;

/// Sensor settings applied by the capture loop and calibration worker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Readout size
    pub resolution: Resolution,
    /// Fixed exposure (shutter) time
    pub exposure: Duration,
    /// Analogue gain (ISO / 100)
    pub gain: f64,
    /// Output encoding
    pub format: ImageFormat,
}

impl CameraSettings {
    pub fn profile(&self) -> CaptureProfile {
        CaptureProfile {
            resolution: self.resolution,
            format: self.format,
        }
    }

    /// Controls that lock in the manual exposure, with the frame duration
    /// pinned to the exposure time.
    pub fn manual_controls(&self) -> Vec<Control> {
        vec![
            Control::AnalogueGain(self.gain),
            Control::ExposureTime(self.exposure),
            Control::FrameDurationLimits(self.exposure, self.exposure),
        ]
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            exposure: Duration::from_secs(1),
            gain: 8.0,
            format: ImageFormat::Jpeg,
        }
    }
}

/// Capture loop pacing and reconfiguration barrier timing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Sleep after a failed capture attempt before retrying
    pub retry_delay: Duration,
    /// How long a reconfiguration waits for the loop to stop per attempt
    pub barrier_timeout: Duration,
    /// Attempts made before a reconfiguration reports `ConfigurationBusy`
    pub barrier_attempts: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
            barrier_timeout: Duration::from_secs(5),
            barrier_attempts: 3,
        }
    }
}

/// Frame fan-out liveness settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    /// A consumer whose signal stays unconsumed longer than this is evicted
    pub staleness_window: Duration,
    /// Upper bound on a single `get_frame` wait
    pub wait_timeout: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(40),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Time auto-exposure is left running before the gain is locked in
    pub settle: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(10),
        }
    }
}

/// External plate solver invocation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Solver executable, resolved through `PATH` when not absolute
    pub binary: PathBuf,
    /// Number of detected sources to try (`--depth`)
    pub depth: u32,
    /// Source detection threshold (`--sigma`)
    pub sigma: f64,
    /// Upper bound on image scale in arcsec per pixel (`-L`, units `app`)
    pub scale_upper: f64,
    /// CPU time budget handed to the solver (`--cpulimit`)
    pub cpu_limit: Duration,
    /// Pass the previous position as a search hint
    pub search_enabled: bool,
    /// Search radius around the hint in degrees
    pub search_radius: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("solve-field"),
            depth: 20,
            sigma: 9.0,
            scale_upper: 30.0,
            cpu_limit: Duration::from_secs(50),
            search_enabled: false,
            search_radius: 90.0,
        }
    }
}

/// Artifacts written after a successful solve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservingConfig {
    /// Append a line to the observation log
    pub save_position: bool,
    /// Archive the solved image under a timestamped name
    pub save_image: bool,
}

impl Default for ObservingConfig {
    fn default() -> Self {
        Self {
            save_position: true,
            save_image: false,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Mode the service starts in
    pub mode: Mode,
    pub camera: CameraSettings,
    pub capture: CaptureConfig,
    pub broadcaster: BroadcasterConfig,
    pub calibration: CalibrationConfig,
    pub solver: SolverConfig,
    pub observing: ObservingConfig,
    /// Directory holding the staged frame, `radec.txt`, `obs.log` and `history/`
    pub solve_dir: PathBuf,
    /// Lines retained in the rolling solver log
    pub rolling_log_capacity: usize,
    /// Sleep between hand-off queue polls while empty
    pub handoff_poll: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Align,
            camera: CameraSettings::default(),
            capture: CaptureConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            calibration: CalibrationConfig::default(),
            solver: SolverConfig::default(),
            observing: ObservingConfig::default(),
            solve_dir: PathBuf::from("solve"),
            rolling_log_capacity: 130,
            handoff_poll: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.camera.resolution, Resolution::new(2000, 1500));
        assert_eq!(config.camera.gain, 8.0);
        assert_eq!(config.solver.depth, 20);
        assert_eq!(config.solver.cpu_limit, Duration::from_secs(50));
        assert!(!config.solver.search_enabled);
        assert!(config.observing.save_position);
        assert_eq!(config.rolling_log_capacity, 130);
    }

    #[test]
    fn test_manual_controls_pin_frame_duration() {
        let settings = CameraSettings {
            exposure: Duration::from_millis(250),
            gain: 4.0,
            ..Default::default()
        };
        let controls = settings.manual_controls();
        assert!(controls.contains(&Control::FrameDurationLimits(
            Duration::from_millis(250),
            Duration::from_millis(250)
        )));
        assert!(controls.contains(&Control::AnalogueGain(4.0)));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ServiceConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
