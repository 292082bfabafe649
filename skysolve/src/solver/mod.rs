//! External plate-solve process driver.
//!
//! Runs one solver process per request, streams its stdout through the line
//! classifier and into the rolling log, and reduces the run to a
//! [`SolveResult`].

pub mod args;
pub mod parser;

pub use args::{SearchHint, SolveRequest};
pub use parser::{SolveAccumulator, SolverLine};

use crate::error::{SkyError, SkyResult};
use crate::state::{ServiceState, SolveResult, SolvedField};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

pub struct SolvePipeline {
    binary: PathBuf,
}

impl SolvePipeline {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run one attempt to completion or until `cancel` turns `true`.
    pub async fn run(
        &self,
        request: &SolveRequest,
        state: &ServiceState,
        cancel: &watch::Receiver<bool>,
    ) -> SolveResult {
        match self.run_inner(request, state, cancel).await {
            Ok(field) => SolveResult::Solved(field),
            Err(SkyError::SolveProcessAborted(reason)) => {
                tracing::warn!("Solve aborted: {reason}");
                SolveResult::Aborted
            }
            Err(e) => {
                tracing::warn!("Solve failed: {e}");
                SolveResult::Failed
            }
        }
    }

    async fn run_inner(
        &self,
        request: &SolveRequest,
        state: &ServiceState,
        cancel: &watch::Receiver<bool>,
    ) -> SkyResult<SolvedField> {
        let mut cancel = cancel.clone();
        if *cancel.borrow() {
            return Err(SkyError::SolveProcessAborted("service shutting down".to_string()));
        }

        state.clear_log();
        let args = request.args();
        tracing::info!("Solving: {} {}", self.binary.display(), args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SkyError::SolverSpawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("solver stderr: {line}");
                }
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            SkyError::SolveProcessAborted("solver stdout unavailable".to_string())
        })?;
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut acc = SolveAccumulator::default();

        loop {
            buf.clear();
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = decode_line(&buf);
                        if let SolverLine::FieldCenter { ra, dec } = acc.feed(&line) {
                            tracing::info!("Field center RA {ra:.6} Dec {dec:.6}");
                        }
                        state.push_log(line);
                    }
                    Err(e) => {
                        tracing::warn!("Error reading solver output: {e}");
                        break;
                    }
                },
                _ = cancelled(&mut cancel) => return Err(abort(&mut child).await),
            }
        }

        // stdout can close while the worker keeps running
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancelled(&mut cancel) => return Err(abort(&mut child).await),
        };

        match acc.finish() {
            Some(field) => Ok(field),
            None => match killed_by_signal(&status) {
                Some(signal) => Err(SkyError::SolveProcessAborted(format!(
                    "solver terminated by signal {signal}"
                ))),
                None => Err(SkyError::SolveProcessFailure),
            },
        }
    }
}

/// Resolves once `rx` reads `true` or its sender is gone.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn abort(child: &mut Child) -> SkyError {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill solver: {e}");
    }
    if let Err(e) = child.wait().await {
        tracing::warn!("Failed to reap solver: {e}");
    }
    SkyError::SolveProcessAborted("cancelled".to_string())
}

/// Strip the line terminator, replacing invalid UTF-8.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if std::str::from_utf8(raw).is_err() {
        tracing::debug!("Solver emitted a line that is not valid UTF-8");
    }
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(unix)]
fn killed_by_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn killed_by_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::SolverConfig;
    use crate::state::Mode;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-solver.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(dir: &Path) -> SolveRequest {
        SolveRequest::new(&dir.join("cap.jpg"), &SolverConfig::default(), None)
    }

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let dir = TempDir::new().unwrap();
        let pipeline = SolvePipeline::new(dir.path().join("does-not-exist"));
        let state = ServiceState::new(Mode::Solving, 16);
        let (_tx, rx) = watch::channel(false);

        let result = pipeline.run(&request(dir.path()), &state, &rx).await;
        assert_eq!(result, SolveResult::Failed);
    }

    #[tokio::test]
    async fn test_log_cleared_and_filled() {
        let dir = TempDir::new().unwrap();
        let pipeline = SolvePipeline::new(script(dir.path(), "echo one\necho two"));
        let state = ServiceState::new(Mode::Solving, 16);
        state.push_log("stale line");
        let (_tx, rx) = watch::channel(false);

        let result = pipeline.run(&request(dir.path()), &state, &rx).await;
        assert_eq!(result, SolveResult::Failed);
        assert_eq!(state.rolling_log(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_receives_request_args() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("args.txt");
        let body = format!(
            "echo \"$@\" > {}\necho 'Field center: (RA,Dec) = (1.5, 2.5) deg.'",
            out.display()
        );
        let pipeline = SolvePipeline::new(script(dir.path(), &body));
        let state = ServiceState::new(Mode::Solving, 16);
        let (_tx, rx) = watch::channel(false);

        let result = pipeline.run(&request(dir.path()), &state, &rx).await;
        assert!(result.is_solved());
        let recorded = std::fs::read_to_string(out).unwrap();
        assert!(recorded.contains("--depth 20 --sigma 9 --overwrite -u app -L 30 --cpulimit 50"));
    }

    #[tokio::test]
    async fn test_cancel_aborts_running_solver() {
        let dir = TempDir::new().unwrap();
        let pipeline = SolvePipeline::new(script(dir.path(), "echo started\nexec sleep 30"));
        let state = ServiceState::new(Mode::Solving, 16);
        let (tx, rx) = watch::channel(false);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            tx.send(true).unwrap();
            tx
        });
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            pipeline.run(&request(dir.path()), &state, &rx),
        )
        .await
        .unwrap();
        assert_eq!(result, SolveResult::Aborted);
        drop(canceller.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_after_stdout_closed_aborts() {
        let dir = TempDir::new().unwrap();
        let pipeline =
            SolvePipeline::new(script(dir.path(), "echo hi\nexec >&-\nexec sleep 30"));
        let state = ServiceState::new(Mode::Solving, 16);
        let (tx, rx) = watch::channel(false);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            tx.send(true).unwrap();
            tx
        });
        let start = std::time::Instant::now();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            pipeline.run(&request(dir.path()), &state, &rx),
        )
        .await
        .unwrap();
        assert_eq!(result, SolveResult::Aborted);
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(state.rolling_log(), vec!["hi"]);
        drop(canceller.await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_stop_reading() {
        let dir = TempDir::new().unwrap();
        let body = "printf 'bad \\377 byte\\n'\necho 'Field center: (RA,Dec) = (1.5, 2.5) deg.'";
        let pipeline = SolvePipeline::new(script(dir.path(), body));
        let state = ServiceState::new(Mode::Solving, 16);
        let (_tx, rx) = watch::channel(false);

        let result = pipeline.run(&request(dir.path()), &state, &rx).await;
        let field = result.field().expect("solved");
        assert_eq!((field.ra, field.dec), (1.5, 2.5));
        let log = state.rolling_log();
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with("bad "));
        assert!(log[0].contains('\u{FFFD}'));
    }
}
