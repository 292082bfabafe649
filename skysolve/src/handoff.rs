//! Freshness-biased hand-off from the capture loop to the solve coordinator.
//!
//! Holds at most one entry per name. Taking an entry drains the queue, so a
//! frame that was superseded before the coordinator got to it is discarded.

use shared::camera_interface::Frame;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Name the capture loop enqueues live frames under.
pub const CAPTURE_SLOT: &str = "capture";

#[derive(Debug, Default)]
pub struct HandoffQueue {
    entries: Mutex<Vec<(String, Frame)>>,
}

impl HandoffQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Frame)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `frame` under `name`, replacing any unconsumed entry with the
    /// same name. Returns the replaced frame.
    pub fn enqueue(&self, name: &str, frame: Frame) -> Option<Frame> {
        let mut entries = self.lock();
        let evicted = entries
            .iter()
            .position(|(n, _)| n == name)
            .map(|idx| entries.remove(idx).1);
        entries.push((name.to_string(), frame));
        evicted
    }

    /// Take the most recently enqueued entry and discard everything else.
    pub fn try_dequeue(&self) -> Option<(String, Frame)> {
        let mut entries = self.lock();
        let newest = entries.pop();
        if !entries.is_empty() {
            tracing::debug!("Hand-off discarded {} superseded frame(s)", entries.len());
            entries.clear();
        }
        newest
    }

    /// Poll until an entry is available.
    ///
    /// Cancel-safe: dropping the future never loses an entry.
    pub async fn dequeue(&self, poll: Duration) -> (String, Frame) {
        loop {
            if let Some(entry) = self.try_dequeue() {
                return entry;
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
