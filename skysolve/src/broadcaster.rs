//! Single-producer frame fan-out to an open set of slow consumers.
//!
//! Every consumer owns a ready flag. `publish` raises the flag of each
//! consumer whose previous frame has been acknowledged; consumers still
//! holding an unconsumed frame are skipped, and dropped entirely once that
//! frame has gone unconsumed for longer than the staleness window. The
//! producer never waits on a consumer.

use shared::camera_interface::Frame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Opaque handle identifying one consumer of the broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl ConsumerId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct ConsumerState {
    ready: bool,
    last_signaled: Instant,
}

impl ConsumerState {
    fn new() -> Self {
        Self {
            ready: false,
            last_signaled: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    consumers: HashMap<ConsumerId, ConsumerState>,
    latest: Option<Frame>,
    closed: bool,
}

/// Outcome of a single `publish` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReport {
    /// Consumers whose signal was raised by this publish
    pub delivered: usize,
    /// Consumers skipped because their previous frame is unconsumed
    pub pending: usize,
    /// Consumers evicted as stale
    pub evicted: usize,
}

pub struct FrameBroadcaster {
    registry: Mutex<Registry>,
    signal: Condvar,
    next_id: AtomicU64,
    staleness_window: Duration,
}

impl FrameBroadcaster {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            signal: Condvar::new(),
            next_id: AtomicU64::new(1),
            staleness_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new consumer and return its handle.
    pub fn subscribe(&self) -> ConsumerId {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().consumers.insert(id, ConsumerState::new());
        tracing::debug!("Consumer {} subscribed", id.0);
        id
    }

    /// Block until `consumer` has an unconsumed frame or `timeout` elapses.
    ///
    /// Unknown handles (never subscribed, or evicted) are registered on the
    /// spot with a cleared signal. Returns `true` when a frame is ready.
    pub fn wait(&self, consumer: ConsumerId, timeout: Duration) -> bool {
        let mut registry = self.lock();
        registry
            .consumers
            .entry(consumer)
            .or_insert_with(ConsumerState::new);

        let (registry, _) = self
            .signal
            .wait_timeout_while(registry, timeout, |r| {
                !r.closed && !r.consumers.get(&consumer).is_some_and(|c| c.ready)
            })
            .unwrap_or_else(|e| e.into_inner());

        !registry.closed && registry.consumers.get(&consumer).is_some_and(|c| c.ready)
    }

    /// Clear `consumer`'s signal after it has taken the current frame.
    pub fn ack(&self, consumer: ConsumerId) {
        if let Some(state) = self.lock().consumers.get_mut(&consumer) {
            state.ready = false;
        }
    }

    /// Store `frame` as the latest and signal every consumer that is ready
    /// for it.
    pub fn publish(&self, frame: Frame) -> PublishReport {
        let now = Instant::now();
        let window = self.staleness_window;
        let mut report = PublishReport::default();

        {
            let mut registry = self.lock();
            registry.latest = Some(frame);
            registry.consumers.retain(|id, state| {
                if !state.ready {
                    state.ready = true;
                    state.last_signaled = now;
                    report.delivered += 1;
                    true
                } else if now.duration_since(state.last_signaled) > window {
                    tracing::debug!("Evicting stale consumer {}", id.0);
                    report.evicted += 1;
                    false
                } else {
                    report.pending += 1;
                    true
                }
            });
        }

        self.signal.notify_all();
        report
    }

    /// The most recently published frame.
    pub fn latest(&self) -> Option<Frame> {
        self.lock().latest.clone()
    }

    /// Wait for a frame, take a copy of it and acknowledge it.
    pub fn next_frame(&self, consumer: ConsumerId, timeout: Duration) -> Option<Frame> {
        if !self.wait(consumer, timeout) {
            return None;
        }
        let mut registry = self.lock();
        if let Some(state) = registry.consumers.get_mut(&consumer) {
            state.ready = false;
        }
        registry.latest.clone()
    }

    /// Wake every waiter and make further waits return immediately.
    pub fn close(&self) {
        self.lock().closed = true;
        self.signal.notify_all();
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn is_registered(&self, consumer: ConsumerId) -> bool {
        self.lock().consumers.contains_key(&consumer)
    }

    /// Whether `consumer` currently holds an unconsumed frame.
    pub fn is_ready(&self, consumer: ConsumerId) -> bool {
        self.lock()
            .consumers
            .get(&consumer)
            .is_some_and(|c| c.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shared::camera_interface::{FrameSource, ImageFormat};
    use std::sync::Arc;
    use std::thread;

    fn frame(seq: u64) -> Frame {
        Frame::new(
            Bytes::from_static(b"\xFF\xD8frame"),
            seq,
            FrameSource::Live,
            ImageFormat::Jpeg,
        )
    }

    #[test]
    fn test_publish_without_ack_keeps_signal() {
        let broadcaster = FrameBroadcaster::new(Duration::from_secs(60));
        let consumer = broadcaster.subscribe();

        let first = broadcaster.publish(frame(1));
        assert_eq!(first.delivered, 1);
        for seq in 2..10 {
            let report = broadcaster.publish(frame(seq));
            assert_eq!(report.pending, 1);
            assert!(broadcaster.is_ready(consumer));
        }
        assert!(broadcaster.wait(consumer, Duration::ZERO));
    }

    #[test]
    fn test_wait_times_out_without_publish() {
        let broadcaster = FrameBroadcaster::new(Duration::from_secs(5));
        let consumer = broadcaster.subscribe();
        let start = Instant::now();
        assert!(!broadcaster.wait(consumer, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_lazily_registers_unknown_consumer() {
        let broadcaster = FrameBroadcaster::new(Duration::from_secs(5));
        let stranger = ConsumerId::from_raw(999);
        assert!(!broadcaster.is_registered(stranger));
        assert!(!broadcaster.wait(stranger, Duration::ZERO));
        assert!(broadcaster.is_registered(stranger));
    }

    #[test]
    fn test_publish_wakes_waiter() {
        let broadcaster = Arc::new(FrameBroadcaster::new(Duration::from_secs(5)));
        let consumer = broadcaster.subscribe();

        let waiter = {
            let broadcaster = broadcaster.clone();
            thread::spawn(move || broadcaster.next_frame(consumer, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        broadcaster.publish(frame(42));

        let received = waiter.join().unwrap().unwrap();
        assert_eq!(received.sequence, 42);
        assert!(!broadcaster.is_ready(consumer));
    }

    #[test]
    fn test_idle_consumer_evicted() {
        let broadcaster = FrameBroadcaster::new(Duration::from_millis(20));
        let idle = broadcaster.subscribe();

        broadcaster.publish(frame(1));
        thread::sleep(Duration::from_millis(40));
        let report = broadcaster.publish(frame(2));

        assert_eq!(report.evicted, 1);
        assert!(!broadcaster.is_registered(idle));
        assert_eq!(broadcaster.consumer_count(), 0);
    }

    #[test]
    fn test_acking_consumer_never_evicted() {
        let broadcaster = Arc::new(FrameBroadcaster::new(Duration::from_millis(150)));
        let consumer = broadcaster.subscribe();

        let producer = {
            let broadcaster = broadcaster.clone();
            thread::spawn(move || {
                let mut evicted = 0;
                for seq in 0..40 {
                    evicted += broadcaster.publish(frame(seq)).evicted;
                    thread::sleep(Duration::from_millis(10));
                }
                evicted
            })
        };

        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            if broadcaster.wait(consumer, Duration::from_millis(5)) {
                broadcaster.ack(consumer);
            }
        }

        assert_eq!(producer.join().unwrap(), 0);
        assert!(broadcaster.is_registered(consumer));
    }

    #[test]
    fn test_all_stale_consumers_evicted_in_one_publish() {
        let broadcaster = FrameBroadcaster::new(Duration::from_millis(10));
        let a = broadcaster.subscribe();
        let b = broadcaster.subscribe();
        let live = broadcaster.subscribe();

        broadcaster.publish(frame(1));
        broadcaster.ack(live);
        thread::sleep(Duration::from_millis(25));
        let report = broadcaster.publish(frame(2));

        assert_eq!(report.evicted, 2);
        assert_eq!(report.delivered, 1);
        assert!(!broadcaster.is_registered(a));
        assert!(!broadcaster.is_registered(b));
        assert!(broadcaster.is_registered(live));
    }

    #[test]
    fn test_close_releases_waiters() {
        let broadcaster = Arc::new(FrameBroadcaster::new(Duration::from_secs(5)));
        let consumer = broadcaster.subscribe();
        let waiter = {
            let broadcaster = broadcaster.clone();
            thread::spawn(move || broadcaster.wait(consumer, Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        broadcaster.close();
        assert!(!waiter.join().unwrap());
    }
}
