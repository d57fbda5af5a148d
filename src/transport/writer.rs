//! Single writer task.
//!
//! The socket sink is owned by exactly one task. Receive, heartbeat, token
//! refresh and `send` all enqueue frames into it, so frames are never
//! interleaved and the sink is closed exactly once.

// ============================================================================
// Imports
// ============================================================================

use futures_util::{Sink, SinkExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

use super::ClosedSignal;

// ============================================================================
// WriterCommand
// ============================================================================

/// Commands consumed by the writer task.
enum WriterCommand {
    /// Write one text frame, optionally reporting completion.
    Frame {
        text: String,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// Close the sink and exit.
    Close,
}

// ============================================================================
// FrameWriter
// ============================================================================

/// Cloneable handle to the writer task.
#[derive(Debug, Clone)]
pub(crate) struct FrameWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl FrameWriter {
    /// Spawns the writer task over `sink`.
    ///
    /// A write failure or a close triggers `closed`.
    pub(crate) fn spawn<S>(sink: S, closed: ClosedSignal) -> (Self, JoinHandle<()>)
    where
        S: Sink<WsMessage, Error = WsError> + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(sink, rx, closed));
        (Self { tx }, handle)
    }

    /// Enqueues a frame without waiting for it to be written.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] if the writer has exited.
    pub(crate) fn enqueue(&self, frame: &Value) -> Result<()> {
        self.tx
            .send(WriterCommand::Frame {
                text: frame.to_string(),
                done: None,
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Writes a frame and waits until the sink has accepted it.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionClosed`] if the writer has exited, or the
    /// underlying WebSocket error.
    pub(crate) async fn send(&self, frame: &Value) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Frame {
                text: frame.to_string(),
                done: Some(done_tx),
            })
            .map_err(|_| Error::ConnectionClosed)?;
        done_rx.await?
    }

    /// Asks the writer to close the socket. Idempotent.
    pub(crate) fn close(&self) {
        let _ = self.tx.send(WriterCommand::Close);
    }
}

// ============================================================================
// Writer Loop
// ============================================================================

async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    closed: ClosedSignal,
) where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Frame { text, done } => {
                trace!(len = text.len(), "Writing frame");
                let result = sink.send(WsMessage::Text(text.into())).await;
                let failed = result.is_err();
                if let Err(e) = &result {
                    warn!(error = %e, "WebSocket write failed");
                }
                if let Some(done) = done {
                    let _ = done.send(result.map_err(Error::from));
                }
                if failed {
                    break;
                }
            }
            WriterCommand::Close => {
                debug!("Closing WebSocket");
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "WebSocket close returned error");
    }
    closed.trigger();

    // Fail anything still queued so callers do not hang.
    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let WriterCommand::Frame { done: Some(done), .. } = command {
            let _ = done.send(Err(Error::ConnectionClosed));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
