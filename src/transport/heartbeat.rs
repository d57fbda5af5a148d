//! Heartbeat sender and ack watchdog.
//!
//! `last_sent` is written only by the heartbeat task. `last_ack` is written
//! by the receive task when a heartbeat ack arrives and read by the
//! watchdog.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use crate::error::Error;
use crate::protocol::frames;

use super::writer::FrameWriter;
use super::{ClosedSignal, ConnectionState, StateCell};

// ============================================================================
// HeartbeatMonitor
// ============================================================================

/// Shared heartbeat bookkeeping for one connection.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    last_sent: Mutex<Instant>,
    last_ack: Mutex<Instant>,
    acks: AtomicU64,
}

impl HeartbeatMonitor {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            last_sent: Mutex::new(now),
            last_ack: Mutex::new(now),
            acks: AtomicU64::new(0),
        }
    }

    /// Restarts both clocks, as if a heartbeat had just been acked.
    pub(crate) fn reset(&self) {
        let now = Instant::now();
        *self.last_sent.lock() = now;
        *self.last_ack.lock() = now;
    }

    /// Records a heartbeat ack from the server.
    pub(crate) fn record_ack(&self) {
        *self.last_ack.lock() = Instant::now();
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of heartbeat acks seen on this connection.
    pub(crate) fn ack_count(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }

    fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_ack.lock())
    }

    fn due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(*self.last_sent.lock()) >= interval
    }

    fn mark_sent(&self, now: Instant) {
        *self.last_sent.lock() = now;
    }
}

// ============================================================================
// Heartbeat Task
// ============================================================================

/// Everything the heartbeat task needs.
pub(crate) struct HeartbeatTask {
    pub(crate) monitor: Arc<HeartbeatMonitor>,
    pub(crate) writer: FrameWriter,
    pub(crate) closed: ClosedSignal,
    pub(crate) state: Arc<StateCell>,
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) tick: Duration,
}

impl HeartbeatTask {
    /// Runs until the connection closes or the watchdog fires.
    pub(crate) async fn run(self) {
        let deadline = self.interval + self.timeout;
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.closed.closed() => {
                    debug!("Heartbeat task stopping: connection closed");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            if self.monitor.due(now, self.interval) {
                if self.writer.enqueue(&frames::heartbeat()).is_err() {
                    debug!("Heartbeat task stopping: writer gone");
                    return;
                }
                self.monitor.mark_sent(now);
            }

            let silent = self.monitor.silence(now);
            if silent > deadline {
                let error = Error::heartbeat_timeout(silent.as_millis() as u64);
                warn!(
                    error = %error,
                    acks = self.monitor.ack_count(),
                    "Closing connection"
                );
                self.state.set(ConnectionState::Degraded);
                self.writer.close();
                self.closed.trigger();
                return;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::testing::RecordingSink;

    fn task(sink: &RecordingSink, monitor: &Arc<HeartbeatMonitor>) -> (HeartbeatTask, ClosedSignal, Arc<StateCell>) {
        let closed = ClosedSignal::new();
        let (writer, _) = FrameWriter::spawn(sink.clone(), closed.clone());
        let state = Arc::new(StateCell::new(ConnectionState::Live));
        let task = HeartbeatTask {
            monitor: Arc::clone(monitor),
            writer,
            closed: closed.clone(),
            state: Arc::clone(&state),
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            tick: Duration::from_secs(1),
        };
        (task, closed, state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_without_acks() {
        let sink = RecordingSink::default();
        let monitor = Arc::new(HeartbeatMonitor::new());
        let (task, closed, state) = task(&sink, &monitor);

        let started = Instant::now();
        task.run().await;

        assert!(started.elapsed() <= Duration::from_secs(3));
        assert_eq!(state.get(), ConnectionState::Degraded);
        assert!(closed.is_closed());
        assert!(sink.frames().iter().any(|f| f.contains(r#""lwp":"/!""#)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_keep_connection_alive() {
        let sink = RecordingSink::default();
        let monitor = Arc::new(HeartbeatMonitor::new());
        let (task, closed, state) = task(&sink, &monitor);

        let handle = tokio::spawn(task.run());
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            monitor.record_ack();
        }

        assert!(!handle.is_finished());
        assert_eq!(state.get(), ConnectionState::Live);
        assert_eq!(monitor.ack_count(), 10);

        closed.trigger();
        handle.await.expect("heartbeat exits");
        assert_eq!(state.get(), ConnectionState::Live);
    }
}
