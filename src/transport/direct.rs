//! Protocol client over a raw WebSocket.
//!
//! # Tasks
//!
//! After [`start_receiving`](ConnectionTransport::start_receiving) each
//! connection runs:
//!
//! | Task | Role |
//! |------|------|
//! | writer | Owns the socket sink; every frame goes through it |
//! | receive | ACKs frames, records heartbeat acks, decodes envelopes |
//! | heartbeat | Sends `/!` and watches for ack silence |
//! | token refresh | Replaces the token and restarts the connection |
//! | dispatch | Runs the user callback |
//!
//! Socket closure from any task fires the connection's [`ClosedSignal`];
//! every other task observes it and exits.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    ACCEPT_ENCODING, ACCEPT_LANGUAGE, CACHE_CONTROL, COOKIE, HeaderName, ORIGIN, PRAGMA,
    USER_AGENT,
};
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::config::DirectOptions;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::protocol::MessageCodec;
use crate::protocol::frames::{self, Registration};

use super::dispatch::{self, Dispatcher};
use super::heartbeat::{HeartbeatMonitor, HeartbeatTask};
use super::token::{TokenRefreshTask, TokenSource, TokenState};
use super::writer::FrameWriter;
use super::{
    ClosedSignal, ConnectionState, ConnectionTransport, MessageHandler, StateCell, log_connect_failure,
};

// ============================================================================
// Constants
// ============================================================================

/// How long `disconnect` lets the writer flush its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Session
// ============================================================================

/// Resources of one live socket.
struct Session {
    writer: FrameWriter,
    closed: ClosedSignal,
    heartbeat: Arc<HeartbeatMonitor>,
    /// Read half, taken by `start_receiving`.
    reader: Option<SplitStream<WsStream>>,
    writer_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    /// Drained after `tasks`, which hold its only sender.
    dispatch_task: Option<JoinHandle<()>>,
}

impl Session {
    async fn shutdown(mut self) {
        self.closed.trigger();
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(task) = self.dispatch_task.take() {
            dispatch::drain(task).await;
        }

        self.writer.close();
        if timeout(WRITER_DRAIN_TIMEOUT, &mut self.writer_task)
            .await
            .is_err()
        {
            debug!("Writer did not drain in time, aborting");
            self.writer_task.abort();
        }
    }

    fn abort(&self) {
        self.closed.trigger();
        for task in self.tasks.iter().chain(&self.dispatch_task) {
            task.abort();
        }
        self.writer_task.abort();
    }
}

// ============================================================================
// DirectTransport
// ============================================================================

/// Speaks the IM protocol over its own WebSocket.
///
/// The access token survives reconnects: a token fetched by the refresh
/// task is reused by the next [`connect`](ConnectionTransport::connect).
pub struct DirectTransport {
    options: DirectOptions,
    credentials: Credentials,
    codec: MessageCodec,
    token_source: Arc<dyn TokenSource>,
    token: Arc<TokenState>,
    state: Arc<StateCell>,
    session: Mutex<Option<Session>>,
    /// Serializes connect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectTransport")
            .field("ws_url", &self.options.ws_url)
            .field("user_id", &self.credentials.user_id())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl DirectTransport {
    /// Creates a disconnected transport.
    #[must_use]
    pub fn new(
        options: DirectOptions,
        credentials: Credentials,
        token_source: Arc<dyn TokenSource>,
        codec: MessageCodec,
    ) -> Self {
        Self {
            options,
            credentials,
            codec,
            token_source,
            token: Arc::new(TokenState::default()),
            state: Arc::new(StateCell::default()),
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Heartbeat acks received on the current connection.
    #[must_use]
    pub fn heartbeat_acks(&self) -> u64 {
        self.session
            .lock()
            .as_ref()
            .map_or(0, |s| s.heartbeat.ack_count())
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    async fn establish(&self) -> Result<Session> {
        self.state.set(ConnectionState::Connecting);
        if self.token.take_restart() {
            info!("Reconnecting with refreshed token");
        }

        let token = self.ensure_token().await?;
        let request = self.upgrade_request()?;

        let connect_timeout = self.options.connect_timeout;
        let (stream, _response) = timeout(connect_timeout, connect_async(request))
            .await
            .map_err(|_| Error::connection_timeout(connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::connect_failure(e.to_string()))?;
        debug!(url = %self.options.ws_url, "WebSocket handshake complete");

        let (sink, reader) = stream.split();
        let closed = ClosedSignal::new();
        let (writer, writer_task) = FrameWriter::spawn(sink, closed.clone());

        if let Err(e) = self.register(&writer, &token).await {
            writer.close();
            writer_task.abort();
            return Err(e);
        }
        self.state.set(ConnectionState::Registered);

        Ok(Session {
            writer,
            closed,
            heartbeat: Arc::new(HeartbeatMonitor::new()),
            reader: Some(reader),
            writer_task,
            tasks: Vec::new(),
            dispatch_task: None,
        })
    }

    async fn ensure_token(&self) -> Result<String> {
        if let Some(token) = self.token.fresh(self.options.token_refresh_interval) {
            debug!("Reusing current access token");
            return Ok(token);
        }
        let token = self
            .token_source
            .fetch_token(self.credentials.device_id())
            .await?;
        self.token.store(token.clone());
        info!("Access token acquired");
        Ok(token)
    }

    fn upgrade_request(&self) -> Result<Request<()>> {
        let mut request = self.options.ws_url.as_str().into_client_request()?;
        let headers: [(HeaderName, &str); 7] = [
            (COOKIE, self.credentials.cookie_header()),
            (ORIGIN, &self.options.origin),
            (USER_AGENT, &self.options.browser_user_agent),
            (PRAGMA, "no-cache"),
            (CACHE_CONTROL, "no-cache"),
            (ACCEPT_ENCODING, "gzip, deflate, br, zstd"),
            (ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9"),
        ];
        for (name, value) in headers {
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("invalid {name} header: {e}")))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    async fn register(&self, writer: &FrameWriter, token: &str) -> Result<()> {
        let registration = Registration {
            app_key: &self.options.app_key,
            token,
            user_agent: &self.options.im_user_agent,
            device_id: self.credentials.device_id(),
        };
        writer.send(&registration.to_frame()).await?;
        sleep(self.options.registration_settle).await;
        writer.send(&frames::sync_status_ack()).await?;
        debug!("Registration frames sent");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------------

    /// Spawns the per-connection tasks. Returns `false` without a session.
    fn spawn_tasks(&self, on_message: MessageHandler) -> bool {
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return false;
        };
        let Some(reader) = session.reader.take() else {
            debug!("Receive path already running");
            return true;
        };

        let (dispatcher, dispatch_task) = Dispatcher::spawn(on_message);
        session.heartbeat.reset();

        let processor = FrameProcessor {
            writer: session.writer.clone(),
            codec: self.codec.clone(),
            heartbeat: Arc::clone(&session.heartbeat),
            dispatcher,
        };
        let receive_task = tokio::spawn(receive_loop(
            reader,
            processor,
            session.closed.clone(),
            Arc::clone(&self.state),
        ));

        let heartbeat_task = tokio::spawn(
            HeartbeatTask {
                monitor: Arc::clone(&session.heartbeat),
                writer: session.writer.clone(),
                closed: session.closed.clone(),
                state: Arc::clone(&self.state),
                interval: self.options.heartbeat_interval,
                timeout: self.options.heartbeat_timeout,
                tick: self.options.watchdog_tick,
            }
            .run(),
        );

        let token_task = tokio::spawn(
            TokenRefreshTask {
                source: Arc::clone(&self.token_source),
                token: Arc::clone(&self.token),
                device_id: self.credentials.device_id().clone(),
                writer: session.writer.clone(),
                closed: session.closed.clone(),
                state: Arc::clone(&self.state),
                refresh_interval: self.options.token_refresh_interval,
                retry_interval: self.options.token_retry_interval,
            }
            .run(),
        );

        session
            .tasks
            .extend([receive_task, heartbeat_task, token_task]);
        session.dispatch_task = Some(dispatch_task);
        true
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.abort();
        }
    }
}

#[async_trait]
impl ConnectionTransport for DirectTransport {
    async fn connect(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return true;
        }

        // A degraded session from a previous attempt is released first.
        let stale = self.session.lock().take();
        if let Some(stale) = stale {
            stale.shutdown().await;
        }

        match self.establish().await {
            Ok(session) => {
                *self.session.lock() = Some(session);
                self.state.set(ConnectionState::Live);
                info!(user_id = self.credentials.user_id(), "Direct transport connected");
                true
            }
            Err(e) => {
                log_connect_failure("direct", &e);
                self.state.set(ConnectionState::Disconnected);
                false
            }
        }
    }

    async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.shutdown().await;
            info!("Direct transport disconnected");
        }
        self.state.set(ConnectionState::Disconnected);
    }

    async fn send(&self, chat_id: &str, user_id: &str, content: &str) -> bool {
        if !self.is_connected() {
            warn!(chat_id, "Send rejected: not connected");
            return false;
        }
        let Some(writer) = self.session.lock().as_ref().map(|s| s.writer.clone()) else {
            return false;
        };

        let envelope = MessageCodec::encode(chat_id, user_id, self.credentials.user_id(), content);
        match writer.send(&envelope).await {
            Ok(()) => {
                debug!(chat_id, len = content.len(), "Message sent");
                true
            }
            Err(e) => {
                warn!(chat_id, error = %e, "Send failed");
                false
            }
        }
    }

    async fn start_receiving(&self, on_message: MessageHandler) {
        if !self.spawn_tasks(on_message) {
            warn!("start_receiving called without a connection");
        }
    }

    fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Live
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

// ============================================================================
// Receive Loop
// ============================================================================

/// Per-frame processing shared by the receive loop.
struct FrameProcessor {
    writer: FrameWriter,
    codec: MessageCodec,
    heartbeat: Arc<HeartbeatMonitor>,
    dispatcher: Dispatcher,
}

impl FrameProcessor {
    fn process(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Ignoring non-JSON frame");
                return;
            }
        };

        if let Some(ack) = frames::ack_for(&frame)
            && let Err(e) = self.writer.enqueue(&ack)
        {
            debug!(error = %e, "ACK not sent");
        }

        if frames::is_heartbeat_ack(&frame) {
            self.heartbeat.record_ack();
            trace!("Heartbeat ack");
            return;
        }

        self.dispatcher.deliver_envelope(&self.codec, &frame);
    }
}

/// Reads frames until the socket or the closed signal ends the connection.
async fn receive_loop<S>(
    mut reader: S,
    processor: FrameProcessor,
    closed: ClosedSignal,
    state: Arc<StateCell>,
) where
    S: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    loop {
        let next = tokio::select! {
            () = closed.closed() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => processor.process(text.as_str()),
            Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => processor.process(text),
                Err(_) => debug!(len = bytes.len(), "Ignoring binary frame"),
            },
            Some(Ok(WsMessage::Close(frame))) => {
                info!(?frame, "WebSocket closed by server");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read failed");
                break;
            }
            None => {
                info!("WebSocket stream ended");
                break;
            }
        }
    }

    state.degrade();
    closed.trigger();
    processor.writer.close();
    debug!("Receive loop stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use futures_util::SinkExt;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::accept_async;

    use crate::identifiers::DeviceId;
    use crate::protocol::{Message, MessageKind};
    use crate::transport::testing::RecordingSink;

    struct CountingSource(AtomicUsize);

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self, _device_id: &DeviceId) -> Result<String> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{n}"))
        }
    }

    fn transport(url: &str, source: Arc<dyn TokenSource>) -> DirectTransport {
        let options = DirectOptions::new()
            .with_ws_url(url)
            .with_registration_settle(Duration::from_millis(10))
            .with_connect_timeout(Duration::from_secs(5));
        let credentials = Credentials::from_cookie_str("unb=300; cna=x").expect("cookies");
        DirectTransport::new(options, credentials, source, MessageCodec::default())
    }

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return serde_json::from_str(text.as_str()).expect("json frame");
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended: {other:?}"),
            }
        }
    }

    async fn send_json(ws: &mut WebSocketStream<TcpStream>, frame: Value) {
        ws.send(WsMessage::Text(frame.to_string().into()))
            .await
            .expect("server send");
    }

    fn chat_frame(mid: &str, content: &str) -> Value {
        json!({
            "lwp": "/s/para",
            "headers": {"mid": mid, "sid": "s-1"},
            "1": {
                "2": "100@goofish",
                "5": 1_718_000_000_000_i64,
                "10": {"reminderContent": content, "senderUserId": "200"}
            }
        })
    }

    #[tokio::test]
    async fn test_receive_acks_every_frame_and_delivers_chat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");

            let reg = next_json(&mut ws).await;
            assert_eq!(reg["lwp"], "/reg");
            assert_eq!(reg["headers"]["token"], "token-0");
            let sync = next_json(&mut ws).await;
            assert_eq!(sync["lwp"], "/r/SyncStatus/ackDiff");

            let unknown = STANDARD.encode(json!({"40": {}}).to_string());
            send_json(&mut ws, chat_frame("m-1 0", "hi")).await;
            send_json(&mut ws, json!({"code": 200, "headers": {"mid": "m-2 0"}})).await;
            send_json(
                &mut ws,
                json!({
                    "headers": {"mid": "m-3 0"},
                    "body": {"syncPushPackage": {"data": [{"data": unknown}]}}
                }),
            )
            .await;

            let mut acks = Vec::new();
            while acks.len() < 3 {
                let frame = next_json(&mut ws).await;
                if frame["code"] == 200 {
                    acks.push(frame["headers"]["mid"].as_str().unwrap_or_default().to_string());
                }
            }

            let outbound = loop {
                let frame = next_json(&mut ws).await;
                if frame["lwp"] == frames::LWP_SEND_MESSAGE {
                    break frame;
                }
            };
            (acks, outbound)
        });

        let source = Arc::new(CountingSource(AtomicUsize::new(0)));
        let transport = transport(&format!("ws://{addr}/"), source);
        assert!(transport.connect().await);
        assert_eq!(transport.state(), ConnectionState::Live);

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        transport
            .start_receiving(Arc::new(move |m| {
                let _ = tx.send(m);
            }))
            .await;

        let delivered = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery in time")
            .expect("message");
        assert_eq!(delivered.kind(), MessageKind::Chat);
        assert_eq!(delivered.content(), "hi");

        // Sent after the ACK wait so the server can read it in order.
        let transport = Arc::new(transport);
        let sender = Arc::clone(&transport);
        let send = tokio::spawn(async move { sender.send("100", "200", "reply").await });

        let (acks, outbound) = timeout(Duration::from_secs(5), server)
            .await
            .expect("server in time")
            .expect("server ok");
        assert_eq!(acks, ["m-1 0", "m-2 0", "m-3 0"]);
        assert_eq!(outbound["body"][0]["cid"], "100@goofish");
        assert!(send.await.expect("send task"));

        assert_eq!(transport.heartbeat_acks(), 1);
        assert!(rx.try_recv().is_err());

        transport.disconnect().await;
        transport.disconnect().await;
        assert!(!transport.is_connected());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_token_reused_across_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let mut tokens = Vec::new();
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.expect("accept");
                let mut ws = accept_async(stream).await.expect("handshake");
                tokens.push(next_json(&mut ws).await["headers"]["token"].clone());
                let _ = next_json(&mut ws).await;
            }
            tokens
        });

        let source = Arc::new(CountingSource(AtomicUsize::new(0)));
        let transport = transport(&format!("ws://{addr}/"), Arc::clone(&source) as Arc<dyn TokenSource>);
        assert!(transport.connect().await);
        assert!(transport.connect().await);
        transport.disconnect().await;
        assert!(transport.connect().await);

        let tokens = server.await.expect("server ok");
        assert_eq!(tokens, [json!("token-0"), json!("token-0")]);
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_failure_returns_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let source = Arc::new(CountingSource(AtomicUsize::new(0)));
        let transport = transport(&format!("ws://{addr}/"), source);
        assert!(!transport.connect().await);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_not_live() {
        let source = Arc::new(CountingSource(AtomicUsize::new(0)));
        let transport = transport("ws://127.0.0.1:9/", source);
        assert!(!transport.send("1", "2", "hello").await);
        transport.start_receiving(Arc::new(|_| {})).await;
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_shutdown_delivers_queued_messages() {
        let sink = RecordingSink::default();
        let closed = ClosedSignal::new();
        let (writer, writer_task) = FrameWriter::spawn(sink.clone(), closed.clone());
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let (dispatcher, dispatch_task) = Dispatcher::spawn(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        for content in ["a", "b", "c"] {
            dispatcher.deliver(Message::new(MessageKind::Chat, json!({})).with_content(content));
        }
        // Stands in for the receive task, the only owner of the sender.
        let receiver = tokio::spawn(async move {
            let _dispatcher = dispatcher;
            std::future::pending::<()>().await;
        });

        let session = Session {
            writer,
            closed,
            heartbeat: Arc::new(HeartbeatMonitor::new()),
            reader: None,
            writer_task,
            tasks: vec![receiver],
            dispatch_task: Some(dispatch_task),
        };
        session.shutdown().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 3);
        assert_eq!(sink.close_count(), 1);
    }

    #[tokio::test]
    async fn test_receive_loop_ends_on_stream_end() {
        let sink = RecordingSink::default();
        let closed = ClosedSignal::new();
        let (writer, writer_task) = FrameWriter::spawn(sink.clone(), closed.clone());
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (dispatcher, _dispatch) = Dispatcher::spawn(Arc::new(move |m| {
            let _ = tx.send(m);
        }));
        let processor = FrameProcessor {
            writer,
            codec: MessageCodec::default(),
            heartbeat: Arc::new(HeartbeatMonitor::new()),
            dispatcher,
        };
        let state = Arc::new(StateCell::new(ConnectionState::Live));

        let history = json!({
            "code": 200,
            "headers": {"mid": "h-1 0"},
            "body": {"userMessageModels": [
                {"message": {"cid": "1@goofish", "extension": {"reminderContent": "old"}}}
            ]}
        });
        let frames = futures_util::stream::iter([
            Ok::<_, WsError>(WsMessage::Text(history.to_string().into())),
            Ok(WsMessage::Text("not json".into())),
        ]);

        receive_loop(frames, processor, closed.clone(), Arc::clone(&state)).await;
        writer_task.await.expect("writer exits");

        assert_eq!(state.get(), ConnectionState::Degraded);
        assert!(closed.is_closed());
        assert_eq!(rx.recv().await.expect("history message").content(), "old");
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(sink.close_count(), 1);
    }
}
