//! Camera abstraction layer for the sky camera service.
//!
//! Provides a unified interface over the vendor camera driver so the capture
//! loop and calibration logic can run against real hardware, a directory of
//! recorded frames, or a scripted mock in tests.

pub mod mock;
pub mod replay;

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Error type for camera operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CameraError {
    /// Hardware communication error
    #[error("Hardware error: {0}")]
    HardwareError(String),
    /// Frame capture error
    #[error("Capture error: {0}")]
    CaptureError(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Operation the camera cannot perform in its current state
    #[error("Invalid camera state: {0}")]
    InvalidState(String),
}

/// Result type for camera operations
pub type CameraResult<T> = Result<T, CameraError>;

/// Sensor readout size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(2000, 1500)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = CameraError;

    /// Parses the `"WIDTHxHEIGHT"` form used by the web UI (e.g. `"1280x960"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| CameraError::ConfigError(format!("resolution '{s}' is not WxH")))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| CameraError::ConfigError(format!("invalid width in '{s}'")))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| CameraError::ConfigError(format!("invalid height in '{s}'")))?;
        if width == 0 || height == 0 {
            return Err(CameraError::ConfigError(format!(
                "resolution '{s}' has zero dimensions"
            )));
        }
        Ok(Self { width, height })
    }
}

/// Encoded output format of captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    /// File extension used when the frame is written to disk.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    /// Detect the encoding from the leading magic bytes.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"\x89PNG") {
            Some(ImageFormat::Png)
        } else if data.starts_with(b"\xFF\xD8") {
            Some(ImageFormat::Jpeg)
        } else {
            None
        }
    }

    /// Guess the format from a file path extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImageFormat::Jpeg => write!(f, "jpeg"),
            ImageFormat::Png => write!(f, "png"),
        }
    }
}

impl FromStr for ImageFormat {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            other => Err(CameraError::ConfigError(format!(
                "unsupported image format '{other}'"
            ))),
        }
    }
}

/// Still-capture configuration handed to [`CameraInterface::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureProfile {
    pub resolution: Resolution,
    pub format: ImageFormat,
}

/// A single driver-level control value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Control {
    /// Enable or disable automatic exposure/gain
    AeEnable(bool),
    /// Analogue sensor gain (ISO / 100)
    AnalogueGain(f64),
    /// Fixed exposure time
    ExposureTime(Duration),
    /// Minimum and maximum frame duration
    FrameDurationLimits(Duration, Duration),
}

/// Where a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameSource {
    #[default]
    Live,
    Replay,
}

impl fmt::Display for FrameSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameSource::Live => write!(f, "live"),
            FrameSource::Replay => write!(f, "replay"),
        }
    }
}

/// An encoded image published by the capture loop.
///
/// The payload is reference counted, so cloning a frame to hand it to the
/// broadcaster and the hand-off queue never copies pixel data.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Encoded image bytes
    pub data: Bytes,
    /// Monotonic sequence number assigned by the capture loop
    pub sequence: u64,
    /// Live capture or replayed file
    pub source: FrameSource,
    /// Encoding of `data`
    pub format: ImageFormat,
    /// Wall-clock time the capture finished
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(data: Bytes, sequence: u64, source: FrameSource, format: ImageFormat) -> Self {
        Self {
            data,
            sequence,
            source,
            format,
            captured_at: Local::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Trait for the camera capability consumed by the capture loop.
///
/// Implementations wrap a vendor driver. Every call may fail transiently;
/// callers are expected to log and retry rather than give up.
pub trait CameraInterface: Send {
    /// Apply a still-capture profile. Only valid while the camera is stopped.
    fn configure(&mut self, profile: &CaptureProfile) -> CameraResult<()>;

    /// Start the sensor streaming.
    fn start(&mut self) -> CameraResult<()>;

    /// Stop the sensor.
    fn stop(&mut self) -> CameraResult<()>;

    /// Apply a batch of driver controls.
    fn set_controls(&mut self, controls: &[Control]) -> CameraResult<()>;

    /// Capture one encoded frame.
    ///
    /// Blocks for roughly one exposure duration; the driver paces the loop.
    fn capture_to_buffer(&mut self) -> CameraResult<Bytes>;

    /// Get camera name/identifier
    fn name(&self) -> &str;

    /// Whether frames from this camera are live or replayed.
    fn source(&self) -> FrameSource {
        FrameSource::Live
    }
}

impl CameraInterface for Box<dyn CameraInterface> {
    fn configure(&mut self, profile: &CaptureProfile) -> CameraResult<()> {
        (**self).configure(profile)
    }

    fn start(&mut self) -> CameraResult<()> {
        (**self).start()
    }

    fn stop(&mut self) -> CameraResult<()> {
        (**self).stop()
    }

    fn set_controls(&mut self, controls: &[Control]) -> CameraResult<()> {
        (**self).set_controls(controls)
    }

    fn capture_to_buffer(&mut self) -> CameraResult<Bytes> {
        (**self).capture_to_buffer()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn source(&self) -> FrameSource {
        (**self).source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_parse() {
        let res: Resolution = "1280x960".parse().unwrap();
        assert_eq!(res, Resolution::new(1280, 960));

        let res: Resolution = " 640 X 480 ".parse().unwrap();
        assert_eq!(res, Resolution::new(640, 480));
    }

    #[test]
    fn test_resolution_parse_rejects_garbage() {
        assert!("1280".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
        assert!("0x480".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(Resolution::new(2000, 1500).to_string(), "2000x1500");
    }

    #[test]
    fn test_image_format_parse_and_extension() {
        assert_eq!("JPEG".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!("png".parse::<ImageFormat>().unwrap(), ImageFormat::Png);
        assert!("tiff".parse::<ImageFormat>().is_err());

        assert_eq!(ImageFormat::Jpeg.extension(), "jpg");
        assert_eq!(ImageFormat::from_extension("JPEG"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_extension("fits"), None);

        assert_eq!(ImageFormat::sniff(b"\xFF\xD8\xFF\xE0"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::sniff(b"\x89PNG\r\n"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::sniff(b"GIF89a"), None);
    }

    #[test]
    fn test_frame_clone_shares_payload() {
        let frame = Frame::new(
            Bytes::from_static(b"\xFF\xD8test"),
            7,
            FrameSource::Live,
            ImageFormat::Jpeg,
        );
        let copy = frame.clone();
        assert_eq!(copy.data.as_ptr(), frame.data.as_ptr());
        assert_eq!(copy.sequence, 7);
        assert_eq!(frame.len(), 6);
    }
}
