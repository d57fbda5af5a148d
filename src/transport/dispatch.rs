//! Hand-off between the receive path and the user callback.
//!
//! The socket read loop never runs user code: decoded messages go into an
//! unbounded queue drained by a dedicated task.
//!
//! On disconnect every sender is dropped first and the task gets
//! [`DRAIN_TIMEOUT`] to hand queued messages to the callback. Whatever is
//! still queued after that is dropped. A panicking callback is caught and
//! logged, which requires `panic = "unwind"` (set for every profile in
//! `Cargo.toml`).

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::protocol::{HistoryBatchParser, Message, MessageCodec};

use super::MessageHandler;

/// How long shutdown lets the callback work through queued messages.
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Sending half of the hand-off queue.
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Message>,
}

impl Dispatcher {
    /// Spawns the dispatch task for `handler`.
    pub(crate) fn spawn(handler: MessageHandler) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let kind = message.kind();
                if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    error!(%kind, "Message handler panicked");
                }
            }
            debug!("Dispatch queue closed");
        });

        (Self { tx }, handle)
    }

    /// Queues a message for the callback.
    ///
    /// Unclassified messages are logged and dropped.
    pub(crate) fn deliver(&self, message: Message) {
        if !message.kind().is_deliverable() {
            debug!(raw = %message.raw(), "Dropping unclassified message");
            return;
        }
        trace!(kind = %message.kind(), chat_id = message.chat_id(), "Queueing message");
        if self.tx.send(message).is_err() {
            debug!("Dispatch task gone, message dropped");
        }
    }

    /// Decodes one inbound envelope and queues every message it yields.
    ///
    /// History batches expand to one message per entry, in order.
    pub(crate) fn deliver_envelope(&self, codec: &MessageCodec, envelope: &Value) {
        if HistoryBatchParser::is_history_batch(envelope) {
            for message in HistoryBatchParser::parse(envelope) {
                self.deliver(message);
            }
            return;
        }
        match codec.decode(envelope) {
            Some(message) => self.deliver(message),
            None => trace!("Envelope matched no message shape"),
        }
    }
}

/// Waits for a dispatch task to empty its queue, then aborts it if needed.
///
/// Every [`Dispatcher`] for the task must already be dropped, otherwise the
/// queue never closes and this waits the full [`DRAIN_TIMEOUT`].
pub(crate) async fn drain(mut task: JoinHandle<()>) {
    if timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
        warn!("Dispatch queue not drained in time, dropping remaining messages");
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    use crate::protocol::MessageKind;

    #[tokio::test]
    async fn test_delivers_in_order_and_skips_unclassified() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |m: Message| sink.lock().push(m.content().to_string()));

        let (dispatcher, task) = Dispatcher::spawn(handler);
        dispatcher.deliver(Message::new(MessageKind::Chat, json!({})).with_content("a"));
        dispatcher.deliver(Message::new(MessageKind::Unclassified, json!({})).with_content("x"));
        dispatcher.deliver(Message::new(MessageKind::Order, json!({})).with_content("b"));
        drop(dispatcher);
        task.await.expect("dispatch exits");

        assert_eq!(*seen.lock(), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_drain_delivers_queued_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |m: Message| sink.lock().push(m.content().to_string()));

        let (dispatcher, task) = Dispatcher::spawn(handler);
        for content in ["a", "b", "c"] {
            dispatcher.deliver(Message::new(MessageKind::Chat, json!({})).with_content(content));
        }
        drop(dispatcher);
        drain(task).await;

        assert_eq!(*seen.lock(), ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_while_a_sender_lives() {
        let handler: MessageHandler = Arc::new(|_| {});
        let (dispatcher, task) = Dispatcher::spawn(handler);

        let started = tokio::time::Instant::now();
        drain(task).await;
        assert!(started.elapsed() >= DRAIN_TIMEOUT);
        drop(dispatcher);
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_dispatch() {
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let handler: MessageHandler = Arc::new(move |m: Message| {
            assert_ne!(m.content(), "boom");
            *counter.lock() += 1;
        });

        let (dispatcher, task) = Dispatcher::spawn(handler);
        dispatcher.deliver(Message::new(MessageKind::Chat, json!({})).with_content("boom"));
        dispatcher.deliver(Message::new(MessageKind::Chat, json!({})).with_content("ok"));
        drop(dispatcher);
        task.await.expect("dispatch exits");

        assert_eq!(*count.lock(), 1);
    }
}
