//! Auto-exposure calibration, run exclusively of the capture loop.
//!
//! Requests are numbered. The worker always runs with the latest settings,
//! so any number of requests that arrive while a run is in progress are
//! satisfied by a single follow-up run.

use crate::config::CalibrationConfig;
use crate::error::{SkyError, SkyResult};
use crate::session::CameraSession;
use crate::solver::cancelled;
use crate::state::ServiceState;
use shared::camera_interface::{CameraInterface, Control};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    completed: u64,
    stopped: bool,
}

/// Resolves once the calibration covering a request has finished.
#[derive(Debug, Clone)]
pub struct CalibrationTicket {
    generation: u64,
    progress: watch::Receiver<Progress>,
}

impl CalibrationTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_done(&self) -> bool {
        self.progress.borrow().completed >= self.generation
    }

    /// Fails with `ServiceStopped` if the worker exits before covering this
    /// request.
    pub async fn wait(mut self) -> SkyResult<()> {
        let generation = self.generation;
        let progress = match self
            .progress
            .wait_for(|p| p.completed >= generation || p.stopped)
            .await
        {
            Ok(progress) => *progress,
            Err(_) => return Err(SkyError::ServiceStopped),
        };
        if progress.completed >= generation {
            Ok(())
        } else {
            Err(SkyError::ServiceStopped)
        }
    }
}

pub struct CalibrationCoordinator<C: CameraInterface> {
    session: Arc<CameraSession<C>>,
    state: Arc<ServiceState>,
    config: CalibrationConfig,
    requested: AtomicU64,
    wake: Notify,
    progress: watch::Sender<Progress>,
}

impl<C: CameraInterface + 'static> CalibrationCoordinator<C> {
    pub fn new(
        session: Arc<CameraSession<C>>,
        state: Arc<ServiceState>,
        config: CalibrationConfig,
    ) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            session,
            state,
            config,
            requested: AtomicU64::new(0),
            wake: Notify::new(),
            progress,
        }
    }

    /// Ask for a calibration with the session's current settings.
    pub fn request(&self) -> SkyResult<CalibrationTicket> {
        if self.is_stopped() {
            return Err(SkyError::ServiceStopped);
        }
        let generation = self.requested.fetch_add(1, Ordering::AcqRel) + 1;
        self.wake.notify_one();
        Ok(CalibrationTicket {
            generation,
            progress: self.progress.subscribe(),
        })
    }

    pub fn completed_generation(&self) -> u64 {
        self.progress.borrow().completed
    }

    /// Whether the worker has exited.
    pub fn is_stopped(&self) -> bool {
        self.progress.borrow().stopped
    }

    /// Worker loop; runs until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let target = self.requested.load(Ordering::Acquire);
            if target > self.completed_generation() {
                match self.calibrate(&mut shutdown).await {
                    Ok(()) => tracing::info!("Calibration {} complete", target),
                    Err(SkyError::ServiceStopped) => break,
                    Err(e) => {
                        tracing::error!("Calibration failed: {e}");
                        self.state.push_log(format!("calibration failed: {e}"));
                    }
                }
                self.progress.send_modify(|p| p.completed = target);
                continue;
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.progress.send_modify(|p| p.stopped = true);
        tracing::debug!("Calibration worker exited");
    }

    async fn calibrate(&self, shutdown: &mut watch::Receiver<bool>) -> SkyResult<()> {
        self.state.set_status_text("stopping camera to apply changes");
        let access = self.session.exclusive().await?;
        let settings = self.session.settings();
        tracing::info!(
            "Calibrating: exposure {:?}, gain {:.2}, settle {:?}",
            settings.exposure,
            settings.gain,
            self.config.settle
        );

        {
            let mut camera = access.camera();
            let started = camera
                .set_controls(&[
                    Control::AeEnable(true),
                    Control::AnalogueGain(settings.gain),
                    Control::ExposureTime(settings.exposure),
                    Control::FrameDurationLimits(settings.exposure, settings.exposure),
                ])
                .and_then(|()| camera.start());
            if let Err(e) = started {
                if let Err(unlock) = camera.set_controls(&[Control::AeEnable(false)]) {
                    tracing::warn!("Failed to disable auto-exposure: {unlock}");
                }
                return Err(e.into());
            }
        }

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.config.settle) => false,
            _ = cancelled(shutdown) => true,
        };

        let locked = {
            let mut camera = access.camera();
            let locked = camera.set_controls(&[Control::AeEnable(false)]);
            let stopped = camera.stop();
            locked.and(stopped)
        };
        drop(access);

        if interrupted {
            return Err(SkyError::ServiceStopped);
        }
        locked?;
        self.state
            .set_status_text(self.state.mode().status_text());
        Ok(())
    }
}
