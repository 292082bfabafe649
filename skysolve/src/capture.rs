use crate::broadcaster::FrameBroadcaster;
use crate::config::CaptureConfig;
use crate::error::SkyError;
use crate::handoff::{HandoffQueue, CAPTURE_SLOT};
use crate::session::{CameraSession, ParkOutcome};
use crate::state::ServiceState;
use shared::camera_interface::{CameraInterface, CameraResult, Frame, ImageFormat};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Everything the capture thread touches.
pub struct CaptureContext<C: CameraInterface> {
    pub session: Arc<CameraSession<C>>,
    pub broadcaster: Arc<FrameBroadcaster>,
    pub queue: Arc<HandoffQueue>,
    pub state: Arc<ServiceState>,
    pub config: CaptureConfig,
}

impl<C: CameraInterface> Clone for CaptureContext<C> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            broadcaster: self.broadcaster.clone(),
            queue: self.queue.clone(),
            state: self.state.clone(),
            config: self.config,
        }
    }
}

pub fn spawn_capture_thread<C: CameraInterface + 'static>(
    ctx: CaptureContext<C>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || capture_loop_blocking(ctx))
}

// Controls stay as the last writer (startup or calibration) left them.
fn start_camera<C: CameraInterface>(session: &CameraSession<C>) -> CameraResult<()> {
    session.lock_camera().start()
}

fn stop_camera<C: CameraInterface>(session: &CameraSession<C>) {
    if let Err(e) = session.lock_camera().stop() {
        tracing::warn!("Failed to stop camera: {e}");
    }
}

/// Capture until the gate aborts.
///
/// Camera errors never end the loop; each failed attempt is logged and
/// retried after `retry_delay`.
pub fn capture_loop_blocking<C: CameraInterface>(ctx: CaptureContext<C>) {
    let gate = ctx.session.gate().clone();
    let mut camera_running = false;
    let mut sequence: u64 = 0;

    tracing::info!("Capture loop started");

    loop {
        if !gate.try_begin() {
            if camera_running {
                stop_camera(&ctx.session);
                camera_running = false;
                tracing::debug!("Camera stopped for pause");
            }
            if gate.park() == ParkOutcome::Abort {
                break;
            }
        }

        if !camera_running {
            match start_camera(&ctx.session) {
                Ok(()) => {
                    camera_running = true;
                    ctx.state.set_status_text("camera started");
                    tracing::info!("Camera started");
                }
                Err(e) => {
                    tracing::warn!("{}", SkyError::CaptureTransient(e));
                    std::thread::sleep(ctx.config.retry_delay);
                    continue;
                }
            }
        }

        let captured = {
            let mut camera = ctx.session.lock_camera();
            camera
                .capture_to_buffer()
                .map(|data| (data, camera.source()))
        };

        match captured {
            Ok((data, source)) => {
                sequence += 1;
                let format = ImageFormat::sniff(&data).unwrap_or(ctx.session.settings().format);
                let frame = Frame::new(data, sequence, source, format);
                let total = ctx.state.record_frame();
                tracing::debug!("Captured frame {} ({} bytes, {} total)", sequence, frame.len(), total);
                route_frame(&ctx, frame);
            }
            Err(e) => {
                tracing::warn!("{}", SkyError::CaptureTransient(e));
                std::thread::sleep(ctx.config.retry_delay);
            }
        }
    }

    if camera_running {
        stop_camera(&ctx.session);
    }
    gate.mark_exited();
    tracing::info!("Capture loop exited");
}

/// Fan a frame out to streaming consumers and the solve hand-off, if the
/// current mode routes capture output.
fn route_frame<C: CameraInterface>(ctx: &CaptureContext<C>, frame: Frame) {
    if !ctx.state.mode().routes_frames() {
        return;
    }
    let report = ctx.broadcaster.publish(frame.clone());
    if report.evicted > 0 {
        tracing::debug!("Broadcaster evicted {} stale consumer(s)", report.evicted);
    }
    if let Some(old) = ctx.queue.enqueue(CAPTURE_SLOT, frame) {
        tracing::debug!("Frame {} superseded before solve", old.sequence);
    }
}
