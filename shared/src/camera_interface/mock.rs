use super::{CameraError, CameraInterface, CameraResult, CaptureProfile, Control};
use bytes::Bytes;
use image::{GrayImage, Luma};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A driver call observed by [`MockCamera`].
#[derive(Debug, Clone, PartialEq)]
pub enum CameraCall {
    Configure(CaptureProfile),
    Start,
    Stop,
    SetControls(Vec<Control>),
    Capture,
}

#[derive(Debug, Default)]
struct ProbeState {
    calls: Vec<CameraCall>,
    violations: Vec<String>,
    pending_failures: usize,
    pending_configure_failures: usize,
    pending_start_failures: usize,
    running: bool,
    capturing: bool,
    captures: u64,
}

/// Shared view into a [`MockCamera`] that stays usable after the camera has
/// been moved into a capture loop.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    inner: Arc<Mutex<ProbeState>>,
}

impl MockProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every driver call in order.
    pub fn calls(&self) -> Vec<CameraCall> {
        self.lock().calls.clone()
    }

    /// Protocol violations (e.g. configure while streaming).
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    /// Make the next `count` capture attempts fail.
    pub fn fail_next_captures(&self, count: usize) {
        self.lock().pending_failures = count;
    }

    /// Make the next `count` `configure` calls fail without applying.
    pub fn fail_next_configures(&self, count: usize) {
        self.lock().pending_configure_failures = count;
    }

    /// Make the next `count` `start` calls fail, leaving the camera stopped.
    pub fn fail_next_starts(&self, count: usize) {
        self.lock().pending_start_failures = count;
    }

    /// Number of successful captures.
    pub fn capture_count(&self) -> u64 {
        self.lock().captures
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Controls applied so far, flattened in call order.
    pub fn applied_controls(&self) -> Vec<Control> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                CameraCall::SetControls(c) => Some(c.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// The most recent profile passed to `configure`.
    pub fn last_profile(&self) -> Option<CaptureProfile> {
        self.lock().calls.iter().rev().find_map(|call| match call {
            CameraCall::Configure(p) => Some(*p),
            _ => None,
        })
    }
}

/// Scripted camera used by tests and the `mock` camera type of the binary.
///
/// Enforces the same ordering rules the real driver does: `configure` only
/// while stopped, `capture_to_buffer` only while started.
pub struct MockCamera {
    probe: MockProbe,
    payload: Bytes,
    capture_delay: Duration,
}

impl MockCamera {
    pub fn new(payload: Bytes) -> Self {
        Self {
            probe: MockProbe::default(),
            payload,
            capture_delay: Duration::ZERO,
        }
    }

    /// Mock producing a PNG gradient of the given size.
    pub fn with_test_pattern(width: u32, height: u32) -> Self {
        Self::new(test_pattern_png(width, height))
    }

    /// Sleep this long inside every capture to imitate exposure pacing.
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }
}

impl CameraInterface for MockCamera {
    fn configure(&mut self, profile: &CaptureProfile) -> CameraResult<()> {
        let mut state = self.probe.lock();
        state.calls.push(CameraCall::Configure(*profile));
        if state.running {
            state
                .violations
                .push("configure called while camera running".to_string());
            return Err(CameraError::InvalidState(
                "camera must be stopped before configure".to_string(),
            ));
        }
        if state.capturing {
            state
                .violations
                .push("configure interleaved with capture".to_string());
        }
        if state.pending_configure_failures > 0 {
            state.pending_configure_failures -= 1;
            return Err(CameraError::ConfigError("injected failure".to_string()));
        }
        Ok(())
    }

    fn start(&mut self) -> CameraResult<()> {
        let mut state = self.probe.lock();
        state.calls.push(CameraCall::Start);
        if state.pending_start_failures > 0 {
            state.pending_start_failures -= 1;
            return Err(CameraError::HardwareError("injected failure".to_string()));
        }
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) -> CameraResult<()> {
        let mut state = self.probe.lock();
        state.calls.push(CameraCall::Stop);
        state.running = false;
        Ok(())
    }

    fn set_controls(&mut self, controls: &[Control]) -> CameraResult<()> {
        let mut state = self.probe.lock();
        state.calls.push(CameraCall::SetControls(controls.to_vec()));
        Ok(())
    }

    fn capture_to_buffer(&mut self) -> CameraResult<Bytes> {
        {
            let mut state = self.probe.lock();
            state.calls.push(CameraCall::Capture);
            if !state.running {
                return Err(CameraError::InvalidState(
                    "capture requested while camera stopped".to_string(),
                ));
            }
            if state.pending_failures > 0 {
                state.pending_failures -= 1;
                return Err(CameraError::CaptureError("injected failure".to_string()));
            }
            state.capturing = true;
        }

        if !self.capture_delay.is_zero() {
            std::thread::sleep(self.capture_delay);
        }

        let mut state = self.probe.lock();
        state.capturing = false;
        state.captures += 1;
        Ok(self.payload.clone())
    }

    fn name(&self) -> &str {
        "MockCamera"
    }
}

/// Encode a horizontal gradient as PNG.
pub fn test_pattern_png(width: u32, height: u32) -> Bytes {
    let img = GrayImage::from_fn(width, height, |x, _y| {
        Luma([((x * 255) / width.max(1)) as u8])
    });
    let mut buf = Vec::new();
    if let Err(e) = img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png) {
        tracing::error!("Failed to encode mock test pattern: {e}");
    }
    Bytes::from(buf)
}
