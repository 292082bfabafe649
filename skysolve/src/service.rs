//! Orchestration facade over the capture thread, solve coordinator and
//! calibration worker.

use crate::artifacts::{ObservationCursor, ObservationEntry, SolveArtifacts};
use crate::broadcaster::{ConsumerId, FrameBroadcaster};
use crate::calibration::{CalibrationCoordinator, CalibrationTicket};
use crate::capture::{spawn_capture_thread, CaptureContext};
use crate::config::{CameraSettings, ServiceConfig};
use crate::coordinator::{SolveCoordinator, SolveTrigger};
use crate::error::{SkyError, SkyResult};
use crate::handoff::HandoffQueue;
use crate::session::CameraSession;
use crate::state::{Mode, ServiceState, ServiceStatus};
use shared::camera_interface::{CameraInterface, Frame, ImageFormat, Resolution};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct SkyService<C: CameraInterface + 'static> {
    config: ServiceConfig,
    session: Arc<CameraSession<C>>,
    broadcaster: Arc<FrameBroadcaster>,
    queue: Arc<HandoffQueue>,
    state: Arc<ServiceState>,
    coordinator: Arc<SolveCoordinator>,
    calibration: Arc<CalibrationCoordinator<C>>,
    shutdown: watch::Sender<bool>,
    capture_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    observations: Mutex<Option<ObservationCursor>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<C: CameraInterface + 'static> SkyService<C> {
    /// Configure the camera and start all workers. Must be called from
    /// within a Tokio runtime.
    pub fn start(mut camera: C, config: ServiceConfig) -> SkyResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SkyError::InvalidArgument(format!("no Tokio runtime: {e}")))?;

        std::fs::create_dir_all(&config.solve_dir)?;
        camera.configure(&config.camera.profile())?;
        camera.set_controls(&config.camera.manual_controls())?;
        tracing::info!(
            "Starting sky service with {} at {} in {} mode",
            camera.name(),
            config.camera.resolution,
            config.mode
        );

        let session = Arc::new(CameraSession::new(
            camera,
            config.camera,
            config.capture,
            config.mode != Mode::Paused,
        ));
        let broadcaster = Arc::new(FrameBroadcaster::new(config.broadcaster.staleness_window));
        let queue = Arc::new(HandoffQueue::new());
        let state = Arc::new(ServiceState::new(config.mode, config.rolling_log_capacity));
        let coordinator = Arc::new(SolveCoordinator::new(
            queue.clone(),
            broadcaster.clone(),
            state.clone(),
            SolveArtifacts::new(&config.solve_dir, config.observing),
            config.solver.clone(),
            config.handoff_poll,
        ));
        let calibration = Arc::new(CalibrationCoordinator::new(
            session.clone(),
            state.clone(),
            config.calibration,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);

        let capture_thread = spawn_capture_thread(CaptureContext {
            session: session.clone(),
            broadcaster: broadcaster.clone(),
            queue: queue.clone(),
            state: state.clone(),
            config: config.capture,
        })?;

        let tasks = vec![
            runtime.spawn(coordinator.clone().run(shutdown_rx.clone())),
            runtime.spawn(calibration.clone().run(shutdown_rx)),
        ];

        Ok(Self {
            config,
            session,
            broadcaster,
            queue,
            state,
            coordinator,
            calibration,
            shutdown,
            capture_thread: Mutex::new(Some(capture_thread)),
            tasks: Mutex::new(tasks),
            observations: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn camera_settings(&self) -> CameraSettings {
        self.session.settings()
    }

    /// Stop capturing without changing the mode.
    pub fn pause(&self) {
        self.session.gate().set_run_mode(false);
        self.state.set_status_text("Paused");
    }

    pub fn resume(&self) {
        self.session.gate().set_run_mode(true);
        self.state.set_status_text(self.state.mode().status_text());
    }

    pub fn mode(&self) -> Mode {
        self.state.mode()
    }

    pub fn set_mode(&self, mode: Mode) {
        let previous = self.state.set_mode(mode);
        match mode {
            Mode::Paused => self.session.gate().set_run_mode(false),
            Mode::Align | Mode::Solving => self.session.gate().set_run_mode(true),
            Mode::Playback => {
                self.queue.clear();
                self.state.clear_log();
            }
        }
        tracing::info!("Mode {} -> {}", previous, mode);
    }

    /// Change the exposure and recalibrate.
    pub fn set_exposure(&self, exposure: Duration) -> SkyResult<CalibrationTicket> {
        if exposure.is_zero() {
            return Err(SkyError::InvalidArgument(
                "exposure must be positive".to_string(),
            ));
        }
        self.ensure_running()?;
        self.session.update_settings(|s| s.exposure = exposure);
        self.state
            .push_log(format!("exposure set to {:.3} s, recalibrating", exposure.as_secs_f64()));
        self.calibration.request()
    }

    /// Change the analogue gain and recalibrate.
    pub fn set_gain(&self, gain: f64) -> SkyResult<CalibrationTicket> {
        if !gain.is_finite() || gain <= 0.0 {
            return Err(SkyError::InvalidArgument(format!("invalid gain {gain}")));
        }
        self.ensure_running()?;
        self.session.update_settings(|s| s.gain = gain);
        self.state
            .push_log(format!("gain set to {gain:.2}, recalibrating"));
        self.calibration.request()
    }

    fn ensure_running(&self) -> SkyResult<()> {
        if *self.shutdown.borrow() || self.calibration.is_stopped() {
            return Err(SkyError::ServiceStopped);
        }
        Ok(())
    }

    /// ISO shorthand for [`Self::set_gain`] (`gain = iso / 100`).
    pub fn set_iso(&self, iso: u32) -> SkyResult<CalibrationTicket> {
        self.set_gain(iso as f64 / 100.0)
    }

    pub async fn set_resolution(&self, resolution: Resolution) -> SkyResult<CameraSettings> {
        self.reconfigure(|s| s.resolution = resolution).await
    }

    pub async fn set_format(&self, format: ImageFormat) -> SkyResult<CameraSettings> {
        self.reconfigure(|s| s.format = format).await
    }

    async fn reconfigure(&self, f: impl FnOnce(&mut CameraSettings)) -> SkyResult<CameraSettings> {
        self.state.set_status_text("stopping camera to apply changes");
        let result = self.session.reconfigure(f).await;
        match &result {
            Ok(_) => self.state.set_status_text(self.state.mode().status_text()),
            Err(e) => self.state.set_status_text(format!("reconfiguration failed: {e}")),
        }
        result
    }

    pub fn subscribe(&self) -> ConsumerId {
        self.broadcaster.subscribe()
    }

    /// Block until the next frame for `consumer`, or `None` after `timeout`
    /// (capped at the configured wait timeout).
    pub fn get_frame(&self, consumer: ConsumerId, timeout: Duration) -> Option<Frame> {
        let timeout = timeout.min(self.config.broadcaster.wait_timeout);
        self.broadcaster.next_frame(consumer, timeout)
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.broadcaster.latest()
    }

    pub fn trigger_solve(&self) -> SolveTrigger {
        self.coordinator.trigger_solve()
    }

    pub fn status(&self) -> ServiceStatus {
        self.state.snapshot(self.session.gate().state())
    }

    /// Load the observation log and select its first entry.
    pub fn start_observations(&self) -> SkyResult<Option<String>> {
        let cursor = self.coordinator.artifacts().observations()?;
        let mut slot = lock(&self.observations);
        let selected = cursor.current().cloned();
        *slot = Some(cursor);
        drop(slot);
        self.select_observation(selected)
    }

    pub fn next_observation(&self) -> SkyResult<Option<String>> {
        let selected = lock(&self.observations)
            .as_mut()
            .and_then(|c| c.next().cloned());
        self.select_observation(selected)
    }

    pub fn prev_observation(&self) -> SkyResult<Option<String>> {
        let selected = lock(&self.observations)
            .as_mut()
            .and_then(|c| c.prev().cloned());
        self.select_observation(selected)
    }

    fn select_observation(&self, entry: Option<ObservationEntry>) -> SkyResult<Option<String>> {
        let Some(entry) = entry else {
            return Ok(None);
        };
        match entry.position {
            Some((ra, dec)) => self.coordinator.artifacts().write_radec(ra, dec)?,
            None => tracing::warn!("Observation '{}' has no position", entry.line),
        }
        Ok(Some(entry.line))
    }

    /// Stop every worker, killing a running solve, and join the capture
    /// thread.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down sky service");
        self.shutdown.send_replace(true);
        self.session.gate().abort();
        self.broadcaster.close();

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Worker task ended abnormally: {e}");
            }
        }

        let capture = lock(&self.capture_thread).take();
        if let Some(handle) = capture {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!("Capture thread panicked"),
                Err(e) => tracing::error!("Failed to join capture thread: {e}"),
            }
        }
        tracing::info!("Sky service stopped");
    }
}

impl<C: CameraInterface + 'static> Drop for SkyService<C> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.session.gate().abort();
        self.broadcaster.close();
    }
}
