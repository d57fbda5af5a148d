//! Access token acquisition and periodic refresh.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

use super::writer::FrameWriter;
use super::{ClosedSignal, ConnectionState, StateCell};

// ============================================================================
// TokenSource
// ============================================================================

/// Issues IM access tokens for a device.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetches a fresh access token.
    ///
    /// # Errors
    ///
    /// [`Error::TokenRefresh`] when the token service rejects the request.
    async fn fetch_token(&self, device_id: &DeviceId) -> Result<String>;
}

/// A token obtained out of band.
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    /// Creates a source that always returns `token`.
    #[inline]
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch_token(&self, _device_id: &DeviceId) -> Result<String> {
        if self.token.is_empty() {
            return Err(Error::token_refresh("static token is empty"));
        }
        Ok(self.token.clone())
    }
}

// ============================================================================
// TokenState
// ============================================================================

/// Current token, shared across reconnects of one transport.
#[derive(Debug, Default)]
pub(crate) struct TokenState {
    current: Mutex<Option<(String, Instant)>>,
    restart_pending: AtomicBool,
}

impl TokenState {
    /// Returns the token if it is younger than `max_age`.
    pub(crate) fn fresh(&self, max_age: Duration) -> Option<String> {
        self.current
            .lock()
            .as_ref()
            .filter(|(_, issued)| issued.elapsed() < max_age)
            .map(|(token, _)| token.clone())
    }

    /// Time left until the token reaches `max_age`; zero if absent.
    pub(crate) fn time_until_stale(&self, max_age: Duration) -> Duration {
        self.current
            .lock()
            .as_ref()
            .map_or(Duration::ZERO, |(_, issued)| max_age.saturating_sub(issued.elapsed()))
    }

    pub(crate) fn store(&self, token: String) {
        *self.current.lock() = Some((token, Instant::now()));
    }

    /// Marks that the connection was closed to pick up a new token.
    pub(crate) fn request_restart(&self) {
        self.restart_pending.store(true, Ordering::SeqCst);
    }

    /// Clears and returns the restart marker.
    pub(crate) fn take_restart(&self) -> bool {
        self.restart_pending.swap(false, Ordering::SeqCst)
    }
}

// ============================================================================
// Refresh Task
// ============================================================================

/// Everything the token refresh task needs.
pub(crate) struct TokenRefreshTask {
    pub(crate) source: Arc<dyn TokenSource>,
    pub(crate) token: Arc<TokenState>,
    pub(crate) device_id: DeviceId,
    pub(crate) writer: FrameWriter,
    pub(crate) closed: ClosedSignal,
    pub(crate) state: Arc<StateCell>,
    pub(crate) refresh_interval: Duration,
    pub(crate) retry_interval: Duration,
}

impl TokenRefreshTask {
    /// Waits for the token to age out, replaces it, then closes the
    /// connection so the next connect registers with the new token.
    ///
    /// Failed fetches are retried every `retry_interval` without touching
    /// the connection. Exits early when the connection closes.
    pub(crate) async fn run(self) {
        let wait = self.token.time_until_stale(self.refresh_interval);
        if !self.sleep_unless_closed(wait).await {
            return;
        }

        loop {
            match self.source.fetch_token(&self.device_id).await {
                Ok(token) => {
                    self.token.store(token);
                    self.token.request_restart();
                    info!("Access token refreshed, restarting connection");
                    self.state.set(ConnectionState::Degraded);
                    self.writer.close();
                    self.closed.trigger();
                    return;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_s = self.retry_interval.as_secs(),
                        "Token refresh failed"
                    );
                    if !self.sleep_unless_closed(self.retry_interval).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns `false` if the connection closed first.
    async fn sleep_unless_closed(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.closed.closed() => {
                debug!("Token refresh task stopping: connection closed");
                false
            }
            () = sleep(duration) => true,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::transport::testing::RecordingSink;

    /// Fails the first `failures` fetches, then succeeds.
    struct CountingSource {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self, _device_id: &DeviceId) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::token_refresh("rate limited"))
            } else {
                Ok(format!("token-{call}"))
            }
        }
    }

    fn refresh_task(
        failures: usize,
        sink: &RecordingSink,
    ) -> (TokenRefreshTask, Arc<CountingSource>, Arc<TokenState>, tokio::task::JoinHandle<()>) {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            failures,
        });
        let token = Arc::new(TokenState::default());
        token.store("initial".into());
        let closed = ClosedSignal::new();
        let (writer, writer_task) = FrameWriter::spawn(sink.clone(), closed.clone());

        let task = TokenRefreshTask {
            source: Arc::clone(&source) as Arc<dyn TokenSource>,
            token: Arc::clone(&token),
            device_id: DeviceId::for_user("1"),
            writer,
            closed,
            state: Arc::new(StateCell::new(ConnectionState::Live)),
            refresh_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(10),
        };
        (task, source, token, writer_task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_closes_socket_once() {
        let sink = RecordingSink::default();
        let (task, source, token, writer_task) = refresh_task(0, &sink);

        let started = Instant::now();
        task.run().await;
        writer_task.await.expect("writer exits");

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.close_count(), 1);
        assert_eq!(token.fresh(Duration::from_secs(60)).as_deref(), Some("token-0"));
        assert!(token.take_restart());
        assert!(!token.take_restart());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_retries_without_closing() {
        let sink = RecordingSink::default();
        let (task, source, _token, writer_task) = refresh_task(2, &sink);
        let state = Arc::clone(&task.state);

        let handle = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.close_count(), 0);
        assert_eq!(state.get(), ConnectionState::Live);

        handle.await.expect("refresh exits");
        writer_task.await.expect("writer exits");
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_refresh() {
        let sink = RecordingSink::default();
        let (task, source, _token, _writer_task) = refresh_task(0, &sink);
        let closed = task.closed.clone();

        let handle = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_secs(5)).await;
        closed.trigger();
        handle.await.expect("refresh exits");

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_token_freshness() {
        let state = TokenState::default();
        assert!(state.fresh(Duration::from_secs(1)).is_none());
        assert_eq!(state.time_until_stale(Duration::from_secs(5)), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_static_source() {
        let device = DeviceId::for_user("1");
        assert_eq!(StaticTokenSource::new("t").fetch_token(&device).await.expect("token"), "t");
        assert!(StaticTokenSource::new("").fetch_token(&device).await.is_err());
    }
}
