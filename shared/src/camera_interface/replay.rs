//! Camera that replays recorded sky images from a directory.
//!
//! Useful for running the full service without hardware attached. Files are
//! served oldest first (by modification time) and the sequence wraps around.

use super::{
    CameraError, CameraInterface, CameraResult, CaptureProfile, Control, FrameSource, ImageFormat,
};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub struct ReplayCamera {
    name: String,
    files: Vec<PathBuf>,
    index: usize,
    exposure: Duration,
    running: bool,
}

impl ReplayCamera {
    /// Index all `.jpg`, `.jpeg` and `.png` files in `dir`.
    pub fn from_dir(dir: &Path) -> CameraResult<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            CameraError::HardwareError(format!("cannot read replay dir {}: {e}", dir.display()))
        })?;

        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .and_then(ImageFormat::from_extension)
                    .is_some()
            })
            .map(|path| {
                let modified = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, path)
            })
            .collect();

        if files.is_empty() {
            return Err(CameraError::HardwareError(format!(
                "no replayable images in {}",
                dir.display()
            )));
        }

        files.sort();
        tracing::info!("Replay camera indexed {} images in {}", files.len(), dir.display());

        Ok(Self {
            name: format!("Replay({})", dir.display()),
            files: files.into_iter().map(|(_, path)| path).collect(),
            index: 0,
            exposure: Duration::from_secs(1),
            running: false,
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Path of the file the next capture will return.
    pub fn next_file(&self) -> &Path {
        &self.files[self.index % self.files.len()]
    }
}

impl CameraInterface for ReplayCamera {
    fn configure(&mut self, profile: &CaptureProfile) -> CameraResult<()> {
        if self.running {
            return Err(CameraError::InvalidState(
                "camera must be stopped before configure".to_string(),
            ));
        }
        tracing::debug!("Replay camera ignoring profile {}", profile.resolution);
        Ok(())
    }

    fn start(&mut self) -> CameraResult<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> CameraResult<()> {
        self.running = false;
        Ok(())
    }

    fn set_controls(&mut self, controls: &[Control]) -> CameraResult<()> {
        for control in controls {
            if let Control::ExposureTime(exposure) = control {
                self.exposure = *exposure;
            }
        }
        Ok(())
    }

    fn capture_to_buffer(&mut self) -> CameraResult<Bytes> {
        if !self.running {
            return Err(CameraError::InvalidState(
                "capture requested while camera stopped".to_string(),
            ));
        }

        std::thread::sleep(self.exposure);

        let path = self.next_file().to_path_buf();
        self.index = (self.index + 1) % self.files.len();
        std::fs::read(&path)
            .map(Bytes::from)
            .map_err(|e| CameraError::CaptureError(format!("{}: {e}", path.display())))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> FrameSource {
        FrameSource::Replay
    }
}
