//! CDP client over a single browser WebSocket.
//!
//! Page sessions are attached with `flatten: true`, so every command and
//! event for every page travels over the one socket and is routed by
//! `sessionId`.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, trace, warn};

use crate::config::BrowserEndpoint;
use crate::error::{Error, Result};
use crate::identifiers::TargetId;
use crate::transport::ClosedSignal;
use crate::transport::writer::FrameWriter;

use super::launcher::BrowserProcess;
use super::{BrowserConnector, BrowserHandle, CdpEvent, PageSession, PageTarget, TargetEvent};

// ============================================================================
// Constants
// ============================================================================

/// Per-command response timeout.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the DevTools WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct CdpRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CdpIncoming {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<CdpErrorBody>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CdpErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    target_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
    opener_id: Option<String>,
}

impl From<TargetInfo> for PageTarget {
    fn from(info: TargetInfo) -> Self {
        Self {
            id: TargetId::new(info.target_id),
            kind: info.kind,
            url: info.url,
            opener: info.opener_id.map(TargetId::new),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

type Pending = FxHashMap<u64, oneshot::Sender<Result<Value>>>;
type Sessions = FxHashMap<String, mpsc::UnboundedSender<CdpEvent>>;

/// Shared state of one DevTools socket.
struct Connection {
    writer: FrameWriter,
    next_id: AtomicU64,
    pending: Mutex<Pending>,
    sessions: Mutex<Sessions>,
    closed: ClosedSignal,
}

impl Connection {
    async fn call(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        if self.closed.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::to_value(CdpRequest {
            id,
            method,
            params,
            session_id,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        trace!(id, method, "CDP call");

        if let Err(e) = self.writer.enqueue(&request) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::cdp(-1, format!("{method} timed out")))
            }
        }
    }

    fn route(&self, incoming: CdpIncoming, target_tx: &mpsc::UnboundedSender<TargetEvent>) {
        if let Some(id) = incoming.id {
            let Some(tx) = self.pending.lock().remove(&id) else {
                trace!(id, "Response for unknown request");
                return;
            };
            let result = match incoming.error {
                Some(error) => Err(Error::cdp(error.code, error.message)),
                None => Ok(incoming.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
            return;
        }

        let Some(method) = incoming.method else {
            return;
        };

        if let Some(session_id) = incoming.session_id {
            let sessions = self.sessions.lock();
            if let Some(tx) = sessions.get(&session_id) {
                let _ = tx.send(CdpEvent {
                    method,
                    params: incoming.params,
                });
            }
            return;
        }

        let event = match method.as_str() {
            "Target.targetCreated" => target_info(&incoming.params).map(TargetEvent::Created),
            "Target.targetInfoChanged" => target_info(&incoming.params).map(TargetEvent::Navigated),
            "Target.targetDestroyed" => incoming
                .params
                .get("targetId")
                .and_then(Value::as_str)
                .map(|id| TargetEvent::Destroyed(TargetId::new(id))),
            "Target.detachedFromTarget" => {
                if let Some(session_id) = incoming.params.get("sessionId").and_then(Value::as_str)
                {
                    self.sessions.lock().remove(session_id);
                }
                None
            }
            _ => None,
        };
        if let Some(event) = event {
            let _ = target_tx.send(event);
        }
    }

    /// Fails in-flight calls and ends every session stream.
    fn shut_down(&self) {
        self.closed.trigger();
        self.pending.lock().clear();
        self.sessions.lock().clear();
    }
}

fn target_info(params: &Value) -> Option<PageTarget> {
    serde_json::from_value::<TargetInfo>(params.get("targetInfo")?.clone())
        .ok()
        .map(PageTarget::from)
}

async fn receive_loop<S>(
    mut reader: S,
    connection: Arc<Connection>,
    target_tx: mpsc::UnboundedSender<TargetEvent>,
) where
    S: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    while let Some(message) = reader.next().await {
        match message {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<CdpIncoming>(text.as_str()) {
                Ok(incoming) => connection.route(incoming, &target_tx),
                Err(e) => warn!(error = %e, "Unparseable CDP message"),
            },
            Ok(WsMessage::Close(_)) => {
                debug!("DevTools socket closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "DevTools socket error");
                break;
            }
        }
    }
    connection.shut_down();
}

// ============================================================================
// CdpBrowser
// ============================================================================

/// A browser reached through its DevTools WebSocket.
pub struct CdpBrowser {
    connection: Arc<Connection>,
    target_events: Mutex<Option<mpsc::UnboundedReceiver<TargetEvent>>>,
    receive_task: JoinHandle<()>,
    process: tokio::sync::Mutex<Option<BrowserProcess>>,
}

impl std::fmt::Debug for CdpBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpBrowser")
            .field("closed", &self.connection.closed.is_closed())
            .finish_non_exhaustive()
    }
}

impl CdpBrowser {
    /// Connects to a browser-level DevTools WebSocket URL.
    ///
    /// # Errors
    ///
    /// Handshake failure or timeout, or a failed `Target.setDiscoverTargets`.
    pub async fn connect(ws_url: &str, process: Option<BrowserProcess>) -> Result<Self> {
        let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(ws_url))
            .await
            .map_err(|_| Error::connection_timeout(CONNECT_TIMEOUT.as_millis() as u64))?
            .map_err(|e| Error::connect_failure(format!("DevTools {ws_url}: {e}")))?;

        let (sink, reader) = stream.split();
        let closed = ClosedSignal::new();
        let (writer, _writer_task) = FrameWriter::spawn(sink, closed.clone());
        let (target_tx, target_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Connection {
            writer,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Pending::default()),
            sessions: Mutex::new(Sessions::default()),
            closed,
        });
        let receive_task = tokio::spawn(receive_loop(reader, Arc::clone(&connection), target_tx));

        let browser = Self {
            connection,
            target_events: Mutex::new(Some(target_rx)),
            receive_task,
            process: tokio::sync::Mutex::new(process),
        };
        browser
            .connection
            .call("Target.setDiscoverTargets", json!({ "discover": true }), None)
            .await?;

        info!(url = ws_url, "Connected to browser");
        Ok(browser)
    }
}

impl Drop for CdpBrowser {
    fn drop(&mut self) {
        self.receive_task.abort();
        self.connection.writer.close();
    }
}

#[async_trait]
impl BrowserHandle for CdpBrowser {
    async fn targets(&self) -> Result<Vec<PageTarget>> {
        let result = self
            .connection
            .call("Target.getTargets", json!({}), None)
            .await?;
        let infos: Vec<TargetInfo> =
            serde_json::from_value(result.get("targetInfos").cloned().unwrap_or_else(|| json!([])))?;
        Ok(infos.into_iter().map(PageTarget::from).collect())
    }

    async fn attach(&self, target: &TargetId) -> Result<Arc<dyn PageSession>> {
        let result = self
            .connection
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target.as_str(), "flatten": true }),
                None,
            )
            .await?;
        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::cdp(-1, "attachToTarget returned no sessionId"))?
            .to_string();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.connection
            .sessions
            .lock()
            .insert(session_id.clone(), event_tx);
        debug!(target_id = %target, session = %session_id, "Attached to target");

        Ok(Arc::new(CdpPage {
            connection: Arc::clone(&self.connection),
            target_id: target.clone(),
            session_id,
            events: Mutex::new(Some(event_rx)),
        }))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.connection.call(method, params, None).await
    }

    fn take_target_events(&self) -> Option<mpsc::UnboundedReceiver<TargetEvent>> {
        self.target_events.lock().take()
    }

    async fn close(&self) {
        self.connection.writer.close();
        self.connection.shut_down();
        self.receive_task.abort();
        if let Some(mut process) = self.process.lock().await.take() {
            process.kill().await;
        }
    }
}

// ============================================================================
// CdpPage
// ============================================================================

/// A flattened session on one target.
pub struct CdpPage {
    connection: Arc<Connection>,
    target_id: TargetId,
    session_id: String,
    events: Mutex<Option<mpsc::UnboundedReceiver<CdpEvent>>>,
}

impl std::fmt::Debug for CdpPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpPage")
            .field("target_id", &self.target_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PageSession for CdpPage {
    fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.connection
            .call(method, params, Some(&self.session_id))
            .await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CdpEvent>> {
        self.events.lock().take()
    }

    async fn detach(&self) {
        self.connection.sessions.lock().remove(&self.session_id);
        if let Err(e) = self
            .connection
            .call(
                "Target.detachFromTarget",
                json!({ "sessionId": self.session_id }),
                None,
            )
            .await
        {
            debug!(target_id = %self.target_id, error = %e, "Detach failed");
        }
    }
}

// ============================================================================
// CdpConnector
// ============================================================================

/// Connects to or launches the configured browser.
#[derive(Debug, Clone)]
pub struct CdpConnector {
    endpoint: BrowserEndpoint,
}

impl CdpConnector {
    /// Creates a connector for `endpoint`.
    #[inline]
    #[must_use]
    pub fn new(endpoint: BrowserEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl BrowserConnector for CdpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrowserHandle>> {
        let browser = match &self.endpoint {
            BrowserEndpoint::DevTools(url) => CdpBrowser::connect(url, None).await?,
            BrowserEndpoint::Launch(options) => {
                let process = BrowserProcess::launch(options).await?;
                let url = process.ws_url().to_string();
                CdpBrowser::connect(&url, Some(process)).await?
            }
        };
        Ok(Arc::new(browser))
    }
}

// ============================================================================
// Tests
// ============================================================================
