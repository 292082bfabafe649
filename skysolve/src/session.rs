//! Exclusive access to the camera and the run/stopped barrier guarding it.
//!
//! The capture thread is the only code that drives the camera while the
//! gate says run. Any other writer (reconfiguration, calibration) first takes
//! a [`GateHold`], which asks the capture thread to stop the camera and park.
//! Once the gate reports `Stopped` the parked thread cannot touch the camera
//! again until every hold has been released.

use crate::config::{CameraSettings, CaptureConfig};
use crate::error::{SkyError, SkyResult};
use serde::{Deserialize, Serialize};
use shared::camera_interface::CameraInterface;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Observable state of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    /// Camera stopped, loop parked
    Stopped,
    /// Loop capturing frames
    Running,
    /// Stop requested, current capture still finishing
    PauseRequested,
    /// Loop has been told to exit
    Aborted,
}

#[derive(Debug)]
struct GateState {
    run_mode: bool,
    holds: usize,
    stopped: bool,
    aborted: bool,
}

impl GateState {
    fn should_run(&self) -> bool {
        self.run_mode && self.holds == 0 && !self.aborted
    }

    fn capture_state(&self) -> CaptureState {
        if self.aborted {
            CaptureState::Aborted
        } else if self.stopped {
            CaptureState::Stopped
        } else if self.should_run() {
            CaptureState::Running
        } else {
            CaptureState::PauseRequested
        }
    }
}

/// What a parked capture loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkOutcome {
    /// The gate reopened; the loop now owns the camera again
    Resume,
    /// The loop must exit
    Abort,
}

pub struct RunGate {
    state: Mutex<GateState>,
    changed: Condvar,
    observer: watch::Sender<CaptureState>,
}

impl RunGate {
    pub fn new(run_mode: bool) -> Self {
        let state = GateState {
            run_mode,
            holds: 0,
            stopped: true,
            aborted: false,
        };
        let (observer, _) = watch::channel(state.capture_state());
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
            observer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &GateState) {
        self.observer.send_replace(state.capture_state());
        self.changed.notify_all();
    }

    fn update(&self, f: impl FnOnce(&mut GateState)) {
        let mut state = self.lock();
        f(&mut state);
        self.publish(&state);
    }

    /// Set the requested run mode (pause / resume).
    pub fn set_run_mode(&self, run: bool) {
        self.update(|s| s.run_mode = run);
    }

    pub fn run_mode(&self) -> bool {
        self.lock().run_mode
    }

    /// Tell the capture loop to exit and wake it if parked.
    pub fn abort(&self) {
        self.update(|s| s.aborted = true);
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn state(&self) -> CaptureState {
        self.lock().capture_state()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.observer.subscribe()
    }

    /// Keep the capture loop stopped until the returned guard is dropped.
    pub fn hold(self: &Arc<Self>) -> GateHold {
        self.update(|s| s.holds += 1);
        GateHold { gate: self.clone() }
    }

    /// Capture-thread side: claim the camera for one more capture.
    ///
    /// Returns `false` when the camera must be stopped and the loop parked.
    pub fn try_begin(&self) -> bool {
        let mut state = self.lock();
        if !state.should_run() {
            return false;
        }
        if state.stopped {
            state.stopped = false;
            self.publish(&state);
        }
        true
    }

    /// Capture-thread side: report the camera stopped, then block until the
    /// gate reopens or the loop is aborted.
    ///
    /// On `Resume` the loop owns the camera again.
    pub fn park(&self) -> ParkOutcome {
        let mut state = self.lock();
        state.stopped = true;
        self.publish(&state);

        let mut state = self
            .changed
            .wait_while(state, |s| !s.aborted && !s.should_run())
            .unwrap_or_else(|e| e.into_inner());

        if state.aborted {
            return ParkOutcome::Abort;
        }
        state.stopped = false;
        self.publish(&state);
        ParkOutcome::Resume
    }

    /// Capture-thread side: final transition on exit.
    pub fn mark_exited(&self) {
        self.update(|s| s.stopped = true);
    }

    /// Wait until the capture loop reports the camera stopped.
    pub async fn wait_stopped(&self, timeout: Duration) -> SkyResult<()> {
        let mut rx = self.subscribe();
        let start = Instant::now();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| matches!(s, CaptureState::Stopped | CaptureState::Aborted))
                .await
                .map(|_| ())
        })
        .await;

        match waited {
            Ok(Ok(())) if self.is_stopped() => Ok(()),
            Ok(_) => Err(SkyError::ServiceStopped),
            Err(_) => Err(SkyError::ConfigurationBusy {
                waited: start.elapsed(),
            }),
        }
    }
}

/// Keeps the capture loop parked while alive.
pub struct GateHold {
    gate: Arc<RunGate>,
}

impl Drop for GateHold {
    fn drop(&mut self) {
        self.gate.update(|s| s.holds = s.holds.saturating_sub(1));
    }
}

impl std::fmt::Debug for GateHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateHold").finish_non_exhaustive()
    }
}

/// The camera plus its current settings, shared between the capture thread
/// and the writers that reconfigure it.
pub struct CameraSession<C: CameraInterface> {
    camera: Mutex<C>,
    settings: Mutex<CameraSettings>,
    gate: Arc<RunGate>,
    writer: tokio::sync::Mutex<()>,
    barrier: CaptureConfig,
}

impl<C: CameraInterface> CameraSession<C> {
    pub fn new(camera: C, settings: CameraSettings, barrier: CaptureConfig, run: bool) -> Self {
        Self {
            camera: Mutex::new(camera),
            settings: Mutex::new(settings),
            gate: Arc::new(RunGate::new(run)),
            writer: tokio::sync::Mutex::new(()),
            barrier,
        }
    }

    pub fn gate(&self) -> &Arc<RunGate> {
        &self.gate
    }

    /// Lock the camera. The capture thread calls this only while the gate
    /// lets it run; writers only while holding [`Exclusive`].
    pub fn lock_camera(&self) -> MutexGuard<'_, C> {
        self.camera.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> CameraSettings {
        *self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut CameraSettings)) -> CameraSettings {
        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut settings);
        *settings
    }

    /// Become the single active writer: park the capture loop and wait for
    /// the camera to stop.
    ///
    /// Each barrier attempt that times out is logged as `ConfigurationBusy`
    /// and retried after a short backoff. The capture loop resumes its prior
    /// run state when the returned guard is dropped.
    pub async fn exclusive(&self) -> SkyResult<Exclusive<'_, C>> {
        let writer = self.writer.lock().await;
        if self.gate.is_aborted() {
            return Err(SkyError::ServiceStopped);
        }
        let hold = self.gate.hold();

        let attempts = self.barrier.barrier_attempts.max(1);
        let mut backoff = Duration::from_millis(50);
        let mut total = Duration::ZERO;
        for attempt in 1..=attempts {
            match self.gate.wait_stopped(self.barrier.barrier_timeout).await {
                Ok(()) => {
                    return Ok(Exclusive {
                        session: self,
                        _hold: hold,
                        _writer: writer,
                    })
                }
                Err(SkyError::ConfigurationBusy { waited }) => {
                    total += waited;
                    tracing::warn!(
                        "Camera still running after {:?} (attempt {}/{})",
                        waited,
                        attempt,
                        attempts
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        total += backoff;
                        backoff = (backoff * 2).min(Duration::from_secs(1));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(SkyError::ConfigurationBusy { waited: total })
    }

    /// Apply a settings change that requires `configure(profile)`.
    ///
    /// The new profile is committed only once the camera has accepted it.
    pub async fn reconfigure(&self, f: impl FnOnce(&mut CameraSettings)) -> SkyResult<CameraSettings> {
        let access = self.exclusive().await?;
        let mut candidate = self.settings();
        f(&mut candidate);
        let profile = candidate.profile();
        access.camera().configure(&profile)?;
        let settings = self.update_settings(|s| {
            s.resolution = profile.resolution;
            s.format = profile.format;
        });
        tracing::info!(
            "Camera reconfigured to {} {}",
            settings.resolution,
            settings.format
        );
        Ok(settings)
    }
}

/// Proof that the capture loop is parked with the camera stopped.
pub struct Exclusive<'a, C: CameraInterface> {
    session: &'a CameraSession<C>,
    _hold: GateHold,
    _writer: tokio::sync::MutexGuard<'a, ()>,
}

impl<'a, C: CameraInterface> Exclusive<'a, C> {
    pub fn camera(&self) -> MutexGuard<'a, C> {
        self.session.lock_camera()
    }
}
