//! Connection transports.
//!
//! Two interchangeable strategies implement [`ConnectionTransport`]:
//!
//! ```text
//! ┌──────────────────┐       wss://wss-goofish.dingtalk.com       ┌──────────┐
//! │ DirectTransport  │◄──────────────────────────────────────────►│ IM       │
//! └──────────────────┘                                            │ gateway  │
//! ┌──────────────────┐   CDP    ┌─────────────────────────┐       │          │
//! │ BrowserMediated  │◄────────►│ Browser page (own WS)   │◄─────►│          │
//! │ Transport        │          └─────────────────────────┘       └──────────┘
//! └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `connect` - Acquire the socket, register, reach `Live`
//! 2. `start_receiving` - Spawn receive, heartbeat, refresh and dispatch tasks
//! 3. `is_connected` polled by the supervisor
//! 4. `disconnect` - Cancel every task and release the socket
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `browser` | CDP-mediated transport and page watchers |
//! | `direct` | Protocol client over a raw WebSocket |
//! | `dispatch` | Hand-off queue to the user callback |
//! | `heartbeat` | Heartbeat sender and ack watchdog |
//! | `token` | Token source and refresh task |
//! | `writer` | Single socket writer task |

// ============================================================================
// Submodules
// ============================================================================

/// CDP-mediated transport.
pub mod browser;

/// Direct protocol client.
pub mod direct;

/// Token acquisition and refresh.
pub mod token;

mod dispatch;
mod heartbeat;
pub(crate) mod writer;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{Level, debug, error, warn};

use crate::error::Error;
use crate::protocol::Message;

// ============================================================================
// Re-exports
// ============================================================================

pub use browser::BrowserMediatedTransport;
pub use direct::DirectTransport;
pub use token::{StaticTokenSource, TokenSource};

// ============================================================================
// Types
// ============================================================================

/// Callback invoked once per classified inbound message.
///
/// Runs on the dispatch task, never on the socket read loop.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

// ============================================================================
// ConnectionTransport
// ============================================================================

/// Common contract of every acquisition strategy.
///
/// No method returns an error: failures are logged and surface as `false`
/// or as `is_connected() == false`.
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    /// Establishes the connection. Idempotent.
    async fn connect(&self) -> bool;

    /// Cancels all owned tasks and releases resources. Idempotent.
    async fn disconnect(&self);

    /// Sends a chat message. `false` on any failure, including not connected.
    async fn send(&self, chat_id: &str, user_id: &str, content: &str) -> bool;

    /// Registers the callback and starts the receive path.
    ///
    /// Must follow a successful [`connect`](Self::connect).
    async fn start_receiving(&self, on_message: MessageHandler);

    /// Non-blocking liveness check.
    fn is_connected(&self) -> bool;

    /// Current lifecycle state, for diagnostics.
    fn state(&self) -> ConnectionState;
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle of one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Acquiring token or socket.
    Connecting,
    /// Registration frames sent.
    Registered,
    /// Ready for traffic.
    Live,
    /// Socket lost or being replaced; awaiting `disconnect`.
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Live => "live",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Shared, logged [`ConnectionState`].
#[derive(Debug, Default)]
pub(crate) struct StateCell(Mutex<ConnectionState>);

impl StateCell {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(Mutex::new(state))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.0.lock()
    }

    pub(crate) fn set(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.0.lock(), next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    /// Moves a live or registering connection to `Degraded`.
    pub(crate) fn degrade(&self) {
        let mut state = self.0.lock();
        if matches!(*state, ConnectionState::Live | ConnectionState::Registered) {
            debug!(from = %*state, "Connection degraded");
            *state = ConnectionState::Degraded;
        }
    }
}

// ============================================================================
// Connect Failures
// ============================================================================

/// Severity of a failed connect.
///
/// Network failures and timeouts log at `WARN`; configuration, browser and
/// process failures log at `ERROR`.
pub(crate) fn connect_failure_level(err: &Error) -> Level {
    if err.is_connect_failure() {
        Level::WARN
    } else {
        Level::ERROR
    }
}

/// Logs a failed `connect` of `transport`.
pub(crate) fn log_connect_failure(transport: &'static str, err: &Error) {
    if connect_failure_level(err) == Level::WARN {
        warn!(transport, timeout = err.is_timeout(), error = %err, "Connect failed");
    } else {
        error!(transport, error = %err, "Connect failed");
    }
}

// ============================================================================
// ClosedSignal
// ============================================================================

/// One-shot "socket is gone" broadcast shared by a connection's tasks.
#[derive(Debug, Clone)]
pub(crate) struct ClosedSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ClosedSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ClosedSignal {
    pub(crate) fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Fires the signal. Idempotent.
    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired.
    pub(crate) async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_signal_wakes_waiters() {
        let signal = ClosedSignal::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.closed().await }
        });

        assert!(!signal.is_closed());
        signal.trigger();
        signal.trigger();
        waiter.await.expect("waiter wakes");
        assert!(signal.is_closed());

        // Already-fired signals resolve immediately.
        signal.closed().await;
    }

    #[test]
    fn test_connect_failure_levels() {
        for err in [
            Error::connect_failure("refused"),
            Error::connection_timeout(20_000),
            Error::browser_detection_timeout(30_000),
        ] {
            assert_eq!(connect_failure_level(&err), Level::WARN, "{err}");
        }
        for err in [
            Error::config("COOKIES_STR is not set"),
            Error::process_launch_failed("chromium not found"),
            Error::cdp(-32000, "Target closed"),
        ] {
            assert_eq!(connect_failure_level(&err), Level::ERROR, "{err}");
        }
    }

    #[test]
    fn test_degrade_only_from_active_states() {
        let cell = StateCell::new(ConnectionState::Disconnected);
        cell.degrade();
        assert_eq!(cell.get(), ConnectionState::Disconnected);

        cell.set(ConnectionState::Live);
        cell.degrade();
        assert_eq!(cell.get(), ConnectionState::Degraded);
    }
}
