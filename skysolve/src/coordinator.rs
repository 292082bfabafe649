//! Drains the hand-off queue, stages frames and drives solve attempts.

use crate::artifacts::SolveArtifacts;
use crate::broadcaster::FrameBroadcaster;
use crate::config::SolverConfig;
use crate::handoff::HandoffQueue;
use crate::solver::{cancelled, SolvePipeline, SolveRequest};
use crate::state::{Mode, ServiceState, SolveResult};
use chrono::Local;
use serde::{Deserialize, Serialize};
use shared::camera_interface::Frame;
use shared::image_proc::focus_metric;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Answer to an explicit "solve current frame" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolveTrigger {
    Accepted,
    /// A solve is already running; the request was dropped
    Ignored,
}

pub struct SolveCoordinator {
    queue: Arc<HandoffQueue>,
    broadcaster: Arc<FrameBroadcaster>,
    state: Arc<ServiceState>,
    artifacts: SolveArtifacts,
    pipeline: SolvePipeline,
    solver: SolverConfig,
    poll: Duration,
    trigger: Notify,
    solve_current: AtomicBool,
    staged: Mutex<Option<PathBuf>>,
}

impl SolveCoordinator {
    pub fn new(
        queue: Arc<HandoffQueue>,
        broadcaster: Arc<FrameBroadcaster>,
        state: Arc<ServiceState>,
        artifacts: SolveArtifacts,
        solver: SolverConfig,
        poll: Duration,
    ) -> Self {
        Self {
            queue,
            broadcaster,
            state,
            artifacts,
            pipeline: SolvePipeline::new(solver.binary.clone()),
            solver,
            poll,
            trigger: Notify::new(),
            solve_current: AtomicBool::new(false),
            staged: Mutex::new(None),
        }
    }

    pub fn artifacts(&self) -> &SolveArtifacts {
        &self.artifacts
    }

    /// Path of the most recently staged frame.
    pub fn staged(&self) -> Option<PathBuf> {
        self.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Request a solve of the staged frame. Ignored while one is running.
    pub fn trigger_solve(&self) -> SolveTrigger {
        if self.state.is_solving() {
            tracing::debug!("Solve trigger ignored; attempt in flight");
            return SolveTrigger::Ignored;
        }
        self.solve_current.store(true, Ordering::Release);
        self.state.set_status_text("Solving");
        self.trigger.notify_one();
        SolveTrigger::Accepted
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        tracing::info!("Solve coordinator started");
        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut stop) => break,
                _ = self.trigger.notified() => {
                    if self.solve_current.swap(false, Ordering::AcqRel) {
                        self.solve_current_frame(&shutdown).await;
                    }
                }
                (name, frame) = self.queue.dequeue(self.poll) => {
                    self.handle_frame(&name, frame, &shutdown).await;
                }
            }
        }
        tracing::info!("Solve coordinator exited");
    }

    async fn handle_frame(&self, name: &str, frame: Frame, shutdown: &watch::Receiver<bool>) {
        tracing::debug!("Dequeued frame {} from '{}'", frame.sequence, name);
        let Some(path) = self.stage(&frame) else {
            return;
        };
        self.measure_focus(&frame).await;

        if self.state.mode() == Mode::Solving {
            self.solve(&path, shutdown).await;
        }
    }

    fn stage(&self, frame: &Frame) -> Option<PathBuf> {
        match self.artifacts.stage(frame) {
            Ok(path) => {
                *self.staged.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.clone());
                Some(path)
            }
            Err(e) => {
                tracing::error!("Failed to stage frame {}: {e}", frame.sequence);
                self.state.push_log(format!("failed to stage frame: {e}"));
                None
            }
        }
    }

    async fn measure_focus(&self, frame: &Frame) {
        let data = frame.data.clone();
        match tokio::task::spawn_blocking(move || focus_metric(&data)).await {
            Ok(Ok(value)) => self.state.set_focus_std(value),
            Ok(Err(e)) => tracing::debug!("Focus metric unavailable: {e}"),
            Err(e) => tracing::warn!("Focus task failed: {e}"),
        }
    }

    async fn solve_current_frame(&self, shutdown: &watch::Receiver<bool>) {
        let path = match self.staged() {
            Some(path) => Some(path),
            None => self
                .broadcaster
                .latest()
                .and_then(|frame| self.stage(&frame)),
        };
        match path {
            Some(path) => {
                self.solve(&path, shutdown).await;
            }
            None => {
                tracing::warn!("Solve requested but no frame has been captured");
                self.state.set_status_text("No frame to solve");
            }
        }
    }

    /// Run one attempt on `image` and publish its outcome.
    pub async fn solve(&self, image: &Path, shutdown: &watch::Receiver<bool>) -> Option<SolveResult> {
        if !self.state.try_begin_solve() {
            return None;
        }

        let request = SolveRequest::new(image, &self.solver, self.state.last_position());
        let result = self.pipeline.run(&request, &self.state, shutdown).await;

        match &result {
            SolveResult::Solved(field) => {
                match self.artifacts.record_solution(field, image, Local::now()) {
                    Ok(line) => self.state.set_status_text(line),
                    Err(e) => {
                        tracing::error!("Failed to record solution: {e}");
                        self.state
                            .set_status_text(format!("{:.6} {:.6}", field.ra, field.dec));
                    }
                }
            }
            SolveResult::Failed => self.state.set_status_text("Failed"),
            SolveResult::Aborted => self.state.set_status_text("Aborted"),
        }

        self.state.set_last_result(result.clone());
        self.state.end_solve();
        Some(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ObservingConfig;
    use bytes::Bytes;
    use shared::camera_interface::{FrameSource, ImageFormat};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn coordinator(dir: &Path, script_body: &str, mode: Mode) -> Arc<SolveCoordinator> {
        let binary = dir.join("fake-solver.sh");
        std::fs::write(&binary, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        Arc::new(SolveCoordinator::new(
            Arc::new(HandoffQueue::new()),
            Arc::new(FrameBroadcaster::new(Duration::from_secs(5))),
            Arc::new(ServiceState::new(mode, 32)),
            SolveArtifacts::new(dir.join("solve"), ObservingConfig::default()),
            SolverConfig {
                binary,
                ..Default::default()
            },
            Duration::from_millis(5),
        ))
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(
            Bytes::from_static(b"\xFF\xD8not really a jpeg"),
            seq,
            FrameSource::Live,
            ImageFormat::Jpeg,
        )
    }

    async fn wait_for_result(state: &ServiceState) -> SolveResult {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(result) = state.last_result() {
                    return result;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_solving_mode_solves_dequeued_frame() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            dir.path(),
            "echo 'Field center: (RA,Dec) = (10.0, 20.0) deg.'",
            Mode::Solving,
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.clone().run(rx));

        coordinator.queue.enqueue("capture", frame(1));
        let result = wait_for_result(&coordinator.state).await;
        assert!(result.is_solved());
        assert!(coordinator.state.status_text().contains("10.000000 20.000000"));
        assert!(coordinator.artifacts().radec_path().exists());

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_align_mode_stages_without_solving() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(dir.path(), "echo nope", Mode::Align);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.clone().run(rx));

        coordinator.queue.enqueue("capture", frame(1));
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.staged().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(coordinator.state.last_result().is_none());

        assert_eq!(coordinator.trigger_solve(), SolveTrigger::Accepted);
        assert_eq!(wait_for_result(&coordinator.state).await, SolveResult::Failed);
        assert_eq!(coordinator.state.status_text(), "Failed");

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_trigger_ignored_while_solving() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(dir.path(), "exec sleep 30", Mode::Align);
        assert!(coordinator.state.try_begin_solve());
        assert_eq!(coordinator.trigger_solve(), SolveTrigger::Ignored);
        coordinator.state.end_solve();
        assert_eq!(coordinator.trigger_solve(), SolveTrigger::Accepted);
    }

    #[tokio::test]
    async fn test_trigger_stages_latest_broadcast_frame() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            dir.path(),
            "echo 'Field center: (RA,Dec) = (1.0, 2.0) deg.'",
            Mode::Align,
        );
        coordinator.broadcaster.publish(frame(7));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.clone().run(rx));

        coordinator.trigger_solve();
        assert!(wait_for_result(&coordinator.state).await.is_solved());
        assert_eq!(
            coordinator.staged(),
            Some(dir.path().join("solve").join("cap.jpg"))
        );

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_running_solve() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(dir.path(), "echo working\nexec sleep 30", Mode::Solving);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.clone().run(rx));

        coordinator.queue.enqueue("capture", frame(1));
        tokio::time::timeout(Duration::from_secs(5), async {
            while !coordinator.state.is_solving() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coordinator.state.last_result(), Some(SolveResult::Aborted));
        assert_eq!(coordinator.state.status_text(), "Aborted");
    }
}
