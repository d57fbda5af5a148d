//! Reconnect loop.
//!
//! ```text
//! ┌────────► connect ──false──┐
//! │            │ true         │
//! │     start_receiving       │
//! │            │              │
//! │    poll is_connected      │
//! │            │ false        │
//! │        disconnect ◄───────┘
//! │            │
//! └──── wait reconnect_delay
//! ```
//!
//! The loop ends only through a [`StopHandle`], which also cuts short any
//! wait or poll in progress.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{info, warn};

use crate::config::SupervisorOptions;
use crate::transport::{ConnectionTransport, MessageHandler};

// ============================================================================
// StopHandle
// ============================================================================

/// Stops a running [`ReconnectSupervisor`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Requests shutdown. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    #[inline]
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

// ============================================================================
// ReconnectSupervisor
// ============================================================================

/// Keeps a transport connected until stopped.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    options: SupervisorOptions,
    stop: StopHandle,
}

impl ReconnectSupervisor {
    /// Creates a supervisor.
    #[must_use]
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            stop: StopHandle {
                tx: Arc::new(watch::Sender::new(false)),
            },
        }
    }

    /// Handle that ends [`run`](Self::run).
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs the connect, watch, reconnect loop until stopped.
    ///
    /// The transport is disconnected before this returns.
    pub async fn run(&self, transport: &dyn ConnectionTransport, on_message: MessageHandler) {
        info!(
            reconnect_delay_s = self.options.reconnect_delay.as_secs(),
            "Supervisor started"
        );

        while !self.stop.is_stopped() {
            if transport.connect().await {
                transport.start_receiving(Arc::clone(&on_message)).await;
                self.watch_connection(transport).await;
            } else {
                warn!("Connect attempt failed");
            }

            transport.disconnect().await;
            if self.stop.is_stopped() {
                break;
            }

            info!(
                delay_s = self.options.reconnect_delay.as_secs(),
                "Reconnecting after delay"
            );
            tokio::select! {
                () = self.stop.stopped() => break,
                () = sleep(self.options.reconnect_delay) => {}
            }
        }

        transport.disconnect().await;
        info!("Supervisor stopped");
    }

    /// Returns when the transport drops or a stop is requested.
    async fn watch_connection(&self, transport: &dyn ConnectionTransport) {
        let poll = self.options.poll_interval;
        let mut ticker = interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.stop.stopped() => return,
                _ = ticker.tick() => {
                    if !transport.is_connected() {
                        warn!(state = %transport.state(), "Connection lost");
                        return;
                    }
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
