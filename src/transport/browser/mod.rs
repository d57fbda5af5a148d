//! Browser-mediated transport.
//!
//! Drives a real browser over CDP and piggybacks on the chat socket the
//! marketplace page opens itself. Nothing is sent to the IM gateway except
//! through that page.
//!
//! # Connect
//!
//! ```text
//! connect browser ─► inject cookies ─► watch every page/iframe
//!        │                                    │
//!        │                          interceptor + Fetch + Network
//!        ▼                                    ▼
//! navigate start URL            console / network signals ─┐
//!        │                                                 ├─► primary
//! detection task (probe every 5s) ─────────────────────────┘
//! ```
//!
//! `connect` succeeds once a page holds a target-host socket, or fails after
//! the detection timeout.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `instrumenter` | Page preparation, event interpretation, probe |
//! | `scripts` | Interceptor, probe and send scripts |
//! | `watcher` | Per-page watchers and primary selection |

// ============================================================================
// Submodules
// ============================================================================

/// Page preparation and signal interpretation.
pub mod instrumenter;

/// Per-page watchers.
pub mod watcher;

mod scripts;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use crate::cdp::{BrowserConnector, BrowserHandle, CdpConnector, PageTarget, TargetEvent, evaluate};
use crate::config::BrowserOptions;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::identifiers::TargetId;
use crate::protocol::MessageCodec;

use super::dispatch::{self, Dispatcher};
use super::{
    ConnectionState, ConnectionTransport, MessageHandler, StateCell, log_connect_failure,
};

use self::watcher::WatchHub;

// ============================================================================
// Re-exports
// ============================================================================

pub use instrumenter::{DetectionChannel, PageInstrumenter, PageSignal, ProbeHit, ScriptInstrumenter};
pub use watcher::PageWatcher;

// ============================================================================
// BrowserSession
// ============================================================================

/// Resources of one browser connection.
struct BrowserSession {
    browser: Arc<dyn BrowserHandle>,
    hub: Arc<WatchHub>,
    tasks: Vec<JoinHandle<()>>,
    /// Drained once the hub has dropped its sender.
    dispatch_task: Option<JoinHandle<()>>,
}

impl BrowserSession {
    async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        self.hub.shutdown().await;
        if let Some(task) = self.dispatch_task {
            dispatch::drain(task).await;
        }
        self.browser.close().await;
    }

    fn abort(&self) {
        for task in self.tasks.iter().chain(&self.dispatch_task) {
            task.abort();
        }
        self.hub.abort();
    }
}

// ============================================================================
// BrowserMediatedTransport
// ============================================================================

/// Sends and receives through a browser page's own WebSocket.
pub struct BrowserMediatedTransport {
    options: BrowserOptions,
    credentials: Credentials,
    codec: MessageCodec,
    connector: Arc<dyn BrowserConnector>,
    instrumenter: Arc<dyn PageInstrumenter>,
    state: Arc<StateCell>,
    session: Mutex<Option<BrowserSession>>,
    /// Serializes connect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BrowserMediatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserMediatedTransport")
            .field("endpoint", &self.options.endpoint)
            .field("state", &self.state.get())
            .field("primary", &self.primary())
            .finish_non_exhaustive()
    }
}

impl BrowserMediatedTransport {
    /// Creates a transport using the CDP client and the interceptor scripts.
    #[must_use]
    pub fn new(options: BrowserOptions, credentials: Credentials, codec: MessageCodec) -> Self {
        let connector = Arc::new(CdpConnector::new(options.endpoint.clone()));
        let instrumenter = Arc::new(ScriptInstrumenter::new(
            &options.target_hosts,
            options.enable_fetch,
        ));
        Self {
            options,
            credentials,
            codec,
            connector,
            instrumenter,
            state: Arc::new(StateCell::default()),
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Replaces the browser connector.
    #[inline]
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn BrowserConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replaces the page instrumenter.
    #[inline]
    #[must_use]
    pub fn with_instrumenter(mut self, instrumenter: Arc<dyn PageInstrumenter>) -> Self {
        self.instrumenter = instrumenter;
        self
    }

    /// Target currently used for sends.
    #[must_use]
    pub fn primary(&self) -> Option<TargetId> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.hub.primary().current())
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    async fn establish(&self) -> Result<BrowserSession> {
        self.state.set(ConnectionState::Connecting);
        let browser = self.connector.connect().await?;
        let hub = WatchHub::new(
            self.options.clone(),
            Arc::clone(&self.instrumenter),
            self.codec.clone(),
            Arc::clone(&self.state),
        );
        let mut session = BrowserSession {
            browser: Arc::clone(&browser),
            hub: Arc::clone(&hub),
            tasks: Vec::new(),
            dispatch_task: None,
        };

        match self.prepare(&browser, &hub, &mut session).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.shutdown().await;
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        browser: &Arc<dyn BrowserHandle>,
        hub: &Arc<WatchHub>,
        session: &mut BrowserSession,
    ) -> Result<()> {
        if self.options.inject_cookies {
            self.inject_cookies(browser.as_ref()).await;
        }

        let targets = browser.targets().await?;
        for target in targets.iter().filter(|t| t.is_inspectable()) {
            if let Err(e) = hub.watch(browser.as_ref(), target).await {
                warn!(target_id = %target.id, error = %e, "Could not instrument page");
            }
        }

        if let Some(url) = &self.options.start_url {
            let page = match targets.iter().find(|t| t.kind == "page") {
                Some(page) => page.id.clone(),
                None => self.open_blank_page(browser.as_ref(), hub).await?,
            };
            if let Some(page_session) = hub.session(&page) {
                page_session
                    .call("Page.navigate", json!({ "url": url }))
                    .await?;
                info!(%url, target_id = %page, "Navigated to start page");
            }
        }

        if let Some(events) = browser.take_target_events() {
            session.tasks.push(tokio::spawn(follow_targets(
                Arc::clone(browser),
                Arc::clone(hub),
                Arc::clone(&self.state),
                events,
            )));
        }

        let detection_interval = self.options.detection_interval;
        let detector = Arc::clone(hub);
        session.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(detection_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if detector.primary().current().is_none() {
                    debug!("Probing pages for a chat socket");
                    detector.probe_all().await;
                }
            }
        }));

        let detection_timeout = self.options.detection_timeout;
        let primary = timeout(detection_timeout, hub.primary().wait())
            .await
            .ok()
            .flatten()
            .ok_or_else(|| Error::browser_detection_timeout(detection_timeout.as_millis() as u64))?;
        info!(target_id = %primary, "Chat socket found");
        Ok(())
    }

    async fn inject_cookies(&self, browser: &dyn BrowserHandle) {
        let cookies: Vec<Value> = self
            .credentials
            .cookies()
            .map(|(name, value)| {
                json!({
                    "name": name,
                    "value": value,
                    "domain": self.options.cookie_domain,
                    "path": "/",
                })
            })
            .collect();
        let count = cookies.len();
        match browser
            .call("Storage.setCookies", json!({ "cookies": cookies }))
            .await
        {
            Ok(_) => debug!(count, domain = %self.options.cookie_domain, "Cookies injected"),
            Err(e) => warn!(error = %e, "Cookie injection failed"),
        }
    }

    async fn open_blank_page(&self, browser: &dyn BrowserHandle, hub: &Arc<WatchHub>) -> Result<TargetId> {
        let created = browser
            .call("Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let id = created
            .get("targetId")
            .and_then(Value::as_str)
            .map(TargetId::new)
            .ok_or_else(|| Error::cdp(-1, "createTarget returned no targetId"))?;
        let target = PageTarget {
            id: id.clone(),
            kind: "page".to_string(),
            url: "about:blank".to_string(),
            opener: None,
        };
        hub.watch(browser, &target).await?;
        Ok(id)
    }
}

impl Drop for BrowserMediatedTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.abort();
        }
    }
}

/// Applies target lifecycle events until the browser goes away.
async fn follow_targets(
    browser: Arc<dyn BrowserHandle>,
    hub: Arc<WatchHub>,
    state: Arc<StateCell>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<TargetEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TargetEvent::Created(target) => {
                if let Some(opener) = &target.opener {
                    debug!(target_id = %target.id, %opener, "Popup opened");
                }
                if let Err(e) = hub.watch(browser.as_ref(), &target).await {
                    debug!(target_id = %target.id, error = %e, "Could not watch new page");
                }
            }
            TargetEvent::Navigated(target) => hub.navigated(browser.as_ref(), &target).await,
            TargetEvent::Destroyed(id) => hub.unwatch(&id).await,
        }
    }
    warn!("Browser connection lost");
    state.degrade();
}

#[async_trait]
impl ConnectionTransport for BrowserMediatedTransport {
    async fn connect(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return true;
        }

        let stale = self.session.lock().take();
        if let Some(stale) = stale {
            stale.shutdown().await;
        }

        match self.establish().await {
            Ok(session) => {
                *self.session.lock() = Some(session);
                self.state.set(ConnectionState::Live);
                info!("Browser transport connected");
                true
            }
            Err(e) => {
                log_connect_failure("browser", &e);
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
            info!("Browser transport disconnected");
        }
        self.state.set(ConnectionState::Disconnected);
    }

    async fn send(&self, chat_id: &str, user_id: &str, content: &str) -> bool {
        if !self.is_connected() {
            warn!(chat_id, "Send rejected: not connected");
            return false;
        }
        let Some(page) = self
            .session
            .lock()
            .as_ref()
            .and_then(|s| s.hub.primary_session())
        else {
            warn!(chat_id, "Send rejected: no primary page");
            return false;
        };

        let envelope = MessageCodec::encode(chat_id, user_id, self.credentials.user_id(), content);
        let script = match scripts::send_script(&envelope) {
            Ok(script) => script,
            Err(e) => {
                warn!(chat_id, error = %e, "Could not build send script");
                return false;
            }
        };

        match evaluate(page.as_ref(), &script).await {
            Ok(result) if result.get("success").and_then(Value::as_bool) == Some(true) => {
                debug!(chat_id, len = content.len(), target_id = %page.target_id(), "Message sent via page");
                true
            }
            Ok(result) => {
                let reason = result.get("message").and_then(Value::as_str).unwrap_or("unknown");
                warn!(chat_id, reason, "Page refused send");
                false
            }
            Err(e) => {
                warn!(chat_id, error = %e, "Send script failed");
                false
            }
        }
    }

    async fn start_receiving(&self, on_message: MessageHandler) {
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            warn!("start_receiving called without a connection");
            return;
        };
        let (dispatcher, dispatch_task) = Dispatcher::spawn(on_message);
        session.hub.set_dispatcher(dispatcher);
        if session.dispatch_task.replace(dispatch_task).is_some() {
            debug!("Replaced message handler");
        }
        debug!("Receiving page frames");
    }

    fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Live
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

// ============================================================================
// Tests
// ============================================================================
