//! Always-on sky camera service.
//!
//! A blocking capture thread pulls frames from the camera and fans them out
//! to any number of slow consumers through [`broadcaster::FrameBroadcaster`].
//! The freshest frame is handed to [`coordinator::SolveCoordinator`], which
//! drives an external plate solver one attempt at a time and publishes the
//! result into [`state::ServiceState`]. Reconfiguration and auto-exposure
//! calibration park the capture loop through the barrier in [`session`].

pub mod artifacts;
pub mod broadcaster;
pub mod calibration;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handoff;
pub mod logging;
pub mod service;
pub mod session;
pub mod solver;
pub mod state;

pub use broadcaster::ConsumerId;
pub use config::ServiceConfig;
pub use coordinator::SolveTrigger;
pub use error::{SkyError, SkyResult};
pub use service::SkyService;
pub use session::CaptureState;
pub use state::{Mode, ServiceStatus, SolveResult, SolvedField};
