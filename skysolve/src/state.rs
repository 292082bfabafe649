//! Shared service state: mode, status text, last solve result and the
//! rolling solver log.
//!
//! All fields are last-writer-wins; readers take snapshots.

use crate::session::CaptureState;
use serde::{Deserialize, Serialize};
use shared::ring_buffer::RingBuffer;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Orchestration mode selected by the operator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Camera stopped, nothing routed
    #[default]
    Paused,
    /// Frames streamed and staged; solves only on request
    Align,
    /// Every staged frame is solved
    Solving,
    /// Browsing recorded frames; live output not routed
    Playback,
}

impl Mode {
    /// Whether captured frames go to the broadcaster and hand-off queue.
    pub fn routes_frames(&self) -> bool {
        matches!(self, Mode::Align | Mode::Solving)
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            Mode::Paused => "Paused",
            Mode::Align => "Align Mode",
            Mode::Solving => "Solving Mode",
            Mode::Playback => "Playback Mode",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mode::Paused => write!(f, "paused"),
            Mode::Align => write!(f, "align"),
            Mode::Solving => write!(f, "solving"),
            Mode::Playback => write!(f, "playback"),
        }
    }
}

/// Position recovered from a successful solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvedField {
    /// Right ascension of the field center in degrees
    pub ra: f64,
    /// Declination of the field center in degrees
    pub dec: f64,
    /// Field size as reported by the solver, verbatim
    pub field_size: Option<String>,
    /// Pixel scale as reported by the solver, verbatim
    pub pixel_scale: Option<String>,
    /// Constellations of the named stars in the field, first-seen order
    pub constellations: Vec<String>,
}

/// Terminal outcome of one solve attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SolveResult {
    Solved(SolvedField),
    /// Solver finished without a field center
    Failed,
    /// Solver was cancelled or killed
    Aborted,
}

impl SolveResult {
    pub fn is_solved(&self) -> bool {
        matches!(self, SolveResult::Solved(_))
    }

    pub fn field(&self) -> Option<&SolvedField> {
        match self {
            SolveResult::Solved(field) => Some(field),
            _ => None,
        }
    }
}

/// Serializable snapshot of everything an observer may display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub mode: Mode,
    pub status_text: String,
    pub capture_state: CaptureState,
    pub solving: bool,
    pub last_result: Option<SolveResult>,
    pub focus_std: Option<f64>,
    pub frames_captured: u64,
    pub rolling_log: Vec<String>,
}

struct Inner {
    mode: Mode,
    status_text: String,
    last_result: Option<SolveResult>,
    last_position: Option<(f64, f64)>,
    focus_std: Option<f64>,
    rolling_log: RingBuffer<String>,
}

pub struct ServiceState {
    inner: Mutex<Inner>,
    solving: AtomicBool,
    frames_captured: AtomicU64,
}

impl ServiceState {
    pub fn new(mode: Mode, log_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode,
                status_text: mode.status_text().to_string(),
                last_result: None,
                last_position: None,
                focus_std: None,
                rolling_log: RingBuffer::new(log_capacity),
            }),
            solving: AtomicBool::new(false),
            frames_captured: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    /// Switch mode and set the matching status text. Returns the old mode.
    pub fn set_mode(&self, mode: Mode) -> Mode {
        let mut inner = self.lock();
        inner.status_text = mode.status_text().to_string();
        std::mem::replace(&mut inner.mode, mode)
    }

    pub fn status_text(&self) -> String {
        self.lock().status_text.clone()
    }

    pub fn set_status_text(&self, text: impl Into<String>) {
        self.lock().status_text = text.into();
    }

    pub fn last_result(&self) -> Option<SolveResult> {
        self.lock().last_result.clone()
    }

    pub fn set_last_result(&self, result: SolveResult) {
        let mut inner = self.lock();
        if let Some(field) = result.field() {
            inner.last_position = Some((field.ra, field.dec));
        }
        inner.last_result = Some(result);
    }

    /// Field center of the most recent successful solve, kept across later
    /// failures. Used as the directed-search hint.
    pub fn last_position(&self) -> Option<(f64, f64)> {
        self.lock().last_position
    }

    pub fn focus_std(&self) -> Option<f64> {
        self.lock().focus_std
    }

    pub fn set_focus_std(&self, value: f64) {
        self.lock().focus_std = Some(value);
    }

    pub fn push_log(&self, line: impl Into<String>) {
        self.lock().rolling_log.push(line.into());
    }

    pub fn clear_log(&self) {
        self.lock().rolling_log.clear();
    }

    pub fn rolling_log(&self) -> Vec<String> {
        self.lock().rolling_log.to_vec()
    }

    /// Claim the single solve slot. Returns `false` if a solve is in flight.
    pub fn try_begin_solve(&self) -> bool {
        self.solving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_solve(&self) {
        self.solving.store(false, Ordering::Release);
    }

    pub fn is_solving(&self) -> bool {
        self.solving.load(Ordering::Acquire)
    }

    pub fn record_frame(&self) -> u64 {
        self.frames_captured.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, capture_state: CaptureState) -> ServiceStatus {
        let inner = self.lock();
        ServiceStatus {
            mode: inner.mode,
            status_text: inner.status_text.clone(),
            capture_state,
            solving: self.is_solving(),
            last_result: inner.last_result.clone(),
            focus_std: inner.focus_std,
            frames_captured: self.frames_captured(),
            rolling_log: inner.rolling_log.to_vec(),
        }
    }
}
