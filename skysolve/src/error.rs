use shared::camera_interface::CameraError;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the capture, calibration and solve components.
///
/// Every variant is absorbed at a component boundary and turned into a status
/// or log update; none of them terminate the service on their own.
#[derive(Error, Debug)]
pub enum SkyError {
    /// A single camera call failed; the capture loop retries.
    #[error("transient capture failure: {0}")]
    CaptureTransient(#[source] CameraError),

    /// The capture loop has not drained to the stopped state yet.
    #[error("camera still running after {waited:?}; reconfiguration must wait")]
    ConfigurationBusy {
        /// How long the caller waited on the barrier.
        waited: Duration,
    },

    /// The solver exited without reporting a field center.
    #[error("solver exited without a field center")]
    SolveProcessFailure,

    /// The solver was cancelled or killed before reporting a field center.
    #[error("solve aborted: {0}")]
    SolveProcessAborted(String),

    /// The solver binary could not be launched.
    #[error("failed to spawn solver '{binary}': {source}")]
    SolverSpawn {
        /// Binary that was attempted.
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// A camera call failed outside the capture loop (e.g. while configuring).
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),

    /// Caller supplied a value the service cannot apply.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The service has been shut down.
    #[error("service stopped")]
    ServiceStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SkyResult<T> = Result<T, SkyError>;
