//! Shared components for the sky camera service.
//!
//! Camera abstraction, image measurements and small containers that are used
//! by the capture, calibration and plate-solving crates.

pub mod camera_interface;
pub mod image_proc;
pub mod ring_buffer;
