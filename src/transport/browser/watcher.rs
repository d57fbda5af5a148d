//! Page watchers and primary selection.
//!
//! Every inspectable target gets a [`PageWatcher`] with its own event pump.
//! Watchers report sockets to the shared [`WatchHub`], which promotes the
//! first page with a target-host socket to primary. Only the primary's
//! frames reach the callback and only the primary is used for sends.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cdp::{BrowserHandle, CdpEvent, PageSession, PageTarget};
use crate::config::BrowserOptions;
use crate::error::{Error, Result};
use crate::identifiers::TargetId;
use crate::protocol::{MessageCodec, frames};
use crate::transport::StateCell;
use crate::transport::dispatch::Dispatcher;

use super::instrumenter::{DetectionChannel, PageInstrumenter, PageSignal};

// ============================================================================
// PageWatcher
// ============================================================================

/// One instrumented page.
pub struct PageWatcher {
    session: Arc<dyn PageSession>,
    detected_url: Mutex<Option<String>>,
    /// `Network` request id of the detected socket, when known.
    socket_request: Mutex<Option<String>>,
}

impl std::fmt::Debug for PageWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWatcher")
            .field("target_id", self.session.target_id())
            .field("detected_url", &*self.detected_url.lock())
            .finish_non_exhaustive()
    }
}

impl PageWatcher {
    fn new(session: Arc<dyn PageSession>) -> Self {
        Self {
            session,
            detected_url: Mutex::new(None),
            socket_request: Mutex::new(None),
        }
    }

    /// The watched target.
    #[inline]
    #[must_use]
    pub fn target_id(&self) -> &TargetId {
        self.session.target_id()
    }

    /// URL of the last target socket seen in this page.
    #[must_use]
    pub fn detected_url(&self) -> Option<String> {
        self.detected_url.lock().clone()
    }

    fn record(&self, url: String, request_id: Option<String>) {
        *self.detected_url.lock() = Some(url);
        if request_id.is_some() {
            *self.socket_request.lock() = request_id;
        }
    }

    /// Forgets the socket if `request_id` is the one being tracked.
    fn take_socket(&self, request_id: &str) -> bool {
        let mut tracked = self.socket_request.lock();
        if tracked.as_deref() != Some(request_id) {
            return false;
        }
        *tracked = None;
        self.detected_url.lock().take();
        true
    }
}

// ============================================================================
// PrimarySlot
// ============================================================================

/// Holds at most one primary page.
#[derive(Debug)]
pub(crate) struct PrimarySlot {
    tx: watch::Sender<Option<TargetId>>,
}

impl Default for PrimarySlot {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(None),
        }
    }
}

impl PrimarySlot {
    pub(crate) fn current(&self) -> Option<TargetId> {
        self.tx.borrow().clone()
    }

    pub(crate) fn is(&self, id: &TargetId) -> bool {
        self.tx.borrow().as_ref() == Some(id)
    }

    /// Makes `id` primary if the slot is empty. `true` only for the
    /// promotion that filled it.
    pub(crate) fn try_promote(&self, id: &TargetId) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(id.clone());
            true
        })
    }

    /// Empties the slot if `id` holds it.
    pub(crate) fn release(&self, id: &TargetId) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.as_ref() != Some(id) {
                return false;
            }
            *slot = None;
            true
        })
    }

    pub(crate) fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Resolves with the primary once there is one.
    pub(crate) async fn wait(&self) -> Option<TargetId> {
        let mut rx = self.tx.subscribe();
        rx.wait_for(Option::is_some).await.ok().and_then(|slot| slot.clone())
    }
}

// ============================================================================
// WatchHub
// ============================================================================

/// Watchers of one browser connection.
pub(crate) struct WatchHub {
    options: BrowserOptions,
    instrumenter: Arc<dyn PageInstrumenter>,
    codec: MessageCodec,
    state: Arc<StateCell>,
    primary: PrimarySlot,
    watchers: Mutex<FxHashMap<TargetId, Arc<PageWatcher>>>,
    pumps: Mutex<FxHashMap<TargetId, JoinHandle<()>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl WatchHub {
    pub(crate) fn new(
        options: BrowserOptions,
        instrumenter: Arc<dyn PageInstrumenter>,
        codec: MessageCodec,
        state: Arc<StateCell>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            instrumenter,
            codec,
            state,
            primary: PrimarySlot::default(),
            watchers: Mutex::new(FxHashMap::default()),
            pumps: Mutex::new(FxHashMap::default()),
            dispatcher: Mutex::new(None),
        })
    }

    pub(crate) fn primary(&self) -> &PrimarySlot {
        &self.primary
    }

    pub(crate) fn session(&self, id: &TargetId) -> Option<Arc<dyn PageSession>> {
        self.watchers
            .lock()
            .get(id)
            .map(|watcher| Arc::clone(&watcher.session))
    }

    pub(crate) fn primary_session(&self) -> Option<Arc<dyn PageSession>> {
        self.session(&self.primary.current()?)
    }

    pub(crate) fn is_watching(&self, id: &TargetId) -> bool {
        self.watchers.lock().contains_key(id)
    }

    pub(crate) fn set_dispatcher(&self, dispatcher: Dispatcher) {
        *self.dispatcher.lock() = Some(dispatcher);
    }

    // ------------------------------------------------------------------------
    // Watch lifecycle
    // ------------------------------------------------------------------------

    /// Attaches to `target`, instruments it and starts its event pump.
    pub(crate) async fn watch(
        self: &Arc<Self>,
        browser: &dyn BrowserHandle,
        target: &PageTarget,
    ) -> Result<()> {
        if !target.is_inspectable() || self.is_watching(&target.id) {
            return Ok(());
        }

        let session = browser.attach(&target.id).await?;
        if let Err(e) = self.instrumenter.instrument(session.as_ref()).await {
            session.detach().await;
            return Err(e);
        }
        let events = session
            .take_events()
            .ok_or_else(|| Error::cdp(-1, "page events already taken"))?;

        let watcher = Arc::new(PageWatcher::new(session));
        self.watchers
            .lock()
            .insert(target.id.clone(), Arc::clone(&watcher));
        let pump = tokio::spawn(pump(Arc::clone(self), watcher, events));
        self.pumps.lock().insert(target.id.clone(), pump);

        info!(target_id = %target.id, kind = %target.kind, url = %target.url, "Watching page");
        Ok(())
    }

    /// Re-runs the interceptor on a navigated page, or starts watching it.
    pub(crate) async fn navigated(self: &Arc<Self>, browser: &dyn BrowserHandle, target: &PageTarget) {
        match self.session(&target.id) {
            Some(session) => {
                if let Err(e) = self.instrumenter.reinject(session.as_ref()).await {
                    debug!(target_id = %target.id, error = %e, "Reinjection failed");
                }
            }
            None => {
                if let Err(e) = self.watch(browser, target).await {
                    debug!(target_id = %target.id, error = %e, "Could not watch navigated page");
                }
            }
        }
    }

    /// Stops watching a destroyed target.
    pub(crate) async fn unwatch(&self, id: &TargetId) {
        if let Some(pump) = self.pumps.lock().remove(id) {
            pump.abort();
        }
        self.forget(id).await;
    }

    async fn forget(&self, id: &TargetId) {
        if self.watchers.lock().remove(id).is_some() {
            debug!(target_id = %id, "Page no longer watched");
        }
        self.release(id).await;
    }

    /// Releases `id` if it is primary, then re-elects among the rest.
    async fn release(&self, id: &TargetId) {
        if !self.primary.release(id) {
            return;
        }
        warn!(target_id = %id, "Primary page lost, re-probing remaining pages");
        if !self.probe_all().await {
            self.state.degrade();
        }
    }

    /// Probes every watcher until one becomes primary. `true` if a primary
    /// exists afterwards.
    pub(crate) async fn probe_all(&self) -> bool {
        if self.primary.current().is_some() {
            return true;
        }
        let watchers: Vec<Arc<PageWatcher>> = self.watchers.lock().values().cloned().collect();
        for watcher in watchers {
            match self.instrumenter.probe(watcher.session.as_ref()).await {
                Ok(Some(hit)) if hit.is_usable() => {
                    debug!(
                        target_id = %watcher.target_id(),
                        method = %hit.method,
                        frame = %hit.frame_name,
                        ready_state = hit.ready_state,
                        "Probe found socket"
                    );
                    self.detected(&watcher, hit.url, None, DetectionChannel::Probe);
                    if self.primary.current().is_some() {
                        return true;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(target_id = %watcher.target_id(), error = %e, "Probe failed"),
            }
        }
        self.primary.current().is_some()
    }

    /// Stops every pump and detaches every session.
    pub(crate) async fn shutdown(&self) {
        self.abort();
        let watchers: Vec<Arc<PageWatcher>> =
            self.watchers.lock().drain().map(|(_, w)| w).collect();
        for watcher in watchers {
            watcher.session.detach().await;
        }
        self.primary.clear();
        self.dispatcher.lock().take();
    }

    pub(crate) fn abort(&self) {
        for (_, pump) in self.pumps.lock().drain() {
            pump.abort();
        }
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    fn detected(
        &self,
        watcher: &PageWatcher,
        url: String,
        request_id: Option<String>,
        via: DetectionChannel,
    ) {
        if !self.options.is_target_url(&url) {
            trace!(%url, "Ignoring non-target socket");
            return;
        }
        let id = watcher.target_id();
        if self.primary.try_promote(id) {
            info!(target_id = %id, %url, %via, "Primary page selected");
        } else {
            debug!(target_id = %id, %url, %via, "Target socket seen");
        }
        watcher.record(url, request_id);
    }

    async fn on_signal(&self, watcher: &PageWatcher, signal: PageSignal) {
        let id = watcher.target_id();
        match signal {
            PageSignal::InterceptorReady => debug!(target_id = %id, "Interceptor ready"),
            PageSignal::SocketDetected {
                url,
                request_id,
                via,
            } => self.detected(watcher, url, request_id, via),
            PageSignal::FrameReceived(text) => {
                if self.primary.is(id) {
                    self.inbound(&text);
                } else {
                    trace!(target_id = %id, "Frame from non-primary page");
                }
            }
            PageSignal::FrameSent(text) => trace!(target_id = %id, len = text.len(), "Page sent frame"),
            PageSignal::SocketClosed { request_id } => {
                if watcher.take_socket(&request_id) {
                    debug!(target_id = %id, "Page socket closed");
                    self.release(id).await;
                }
            }
            PageSignal::SendError(message) => warn!(target_id = %id, %message, "Page send error"),
            PageSignal::FetchPaused { request_id, url } => {
                if let Err(e) = watcher
                    .session
                    .call("Fetch.continueRequest", json!({ "requestId": request_id }))
                    .await
                {
                    debug!(target_id = %id, error = %e, "Fetch.continueRequest failed");
                }
                self.detected(watcher, url, None, DetectionChannel::Fetch);
            }
        }
    }

    /// Decodes a frame read by the page's own client. No ACK is sent.
    fn inbound(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => {
                trace!("Ignoring non-JSON page frame");
                return;
            }
        };
        if frames::is_heartbeat_ack(&frame) {
            trace!("Page heartbeat ack");
            return;
        }
        let Some(dispatcher) = self.dispatcher.lock().clone() else {
            trace!("No receiver registered, frame dropped");
            return;
        };
        dispatcher.deliver_envelope(&self.codec, &frame);
    }
}

async fn pump(hub: Arc<WatchHub>, watcher: Arc<PageWatcher>, mut events: mpsc::UnboundedReceiver<CdpEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(signal) = hub.instrumenter.interpret(&event) {
            hub.on_signal(&watcher, signal).await;
        }
    }
    debug!(target_id = %watcher.target_id(), "Page event stream ended");
    hub.pumps.lock().remove(watcher.target_id());
    hub.forget(watcher.target_id()).await;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Barrier;

    use crate::config::{BrowserEndpoint, DEFAULT_TARGET_HOSTS};
    use crate::protocol::{Message, MessageKind};
    use crate::transport::testing::{FakeBrowser, FakePage, eventually};
    use crate::transport::{ConnectionState, MessageHandler};

    use super::super::instrumenter::ScriptInstrumenter;

    const SOCKET: &str = "wss://wss-goofish.dingtalk.com/";

    fn hub() -> (Arc<WatchHub>, Arc<StateCell>) {
        let options = BrowserOptions::new(BrowserEndpoint::DevTools("ws://unused".into()));
        let hosts: Vec<String> = DEFAULT_TARGET_HOSTS.iter().map(|h| (*h).to_string()).collect();
        let state = Arc::new(StateCell::new(ConnectionState::Live));
        let hub = WatchHub::new(
            options,
            Arc::new(ScriptInstrumenter::new(&hosts, true)),
            MessageCodec::default(),
            Arc::clone(&state),
        );
        (hub, state)
    }

    fn target(page: &FakePage) -> PageTarget {
        PageTarget {
            id: page.target_id().clone(),
            kind: "page".into(),
            url: "https://www.goofish.com/".into(),
            opener: None,
        }
    }

    fn probe_hit() -> Value {
        json!({"found": true, "url": SOCKET, "readyState": 1, "method": "injected", "frameName": "main"})
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_concurrent_promotions_elect_one() {
        let slot = Arc::new(PrimarySlot::default());
        let barrier = Arc::new(Barrier::new(3));
        let wins = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = ["A", "B", "C"]
            .into_iter()
            .map(|id| {
                let (slot, barrier, wins) = (Arc::clone(&slot), Arc::clone(&barrier), Arc::clone(&wins));
                tokio::spawn(async move {
                    barrier.wait().await;
                    if slot.try_promote(&TargetId::new(id)) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("task");
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        let primary = slot.current().expect("primary");
        assert!(!slot.release(&TargetId::new("nobody")));
        assert!(slot.release(&primary));
        assert_eq!(slot.current(), None);
    }

    #[tokio::test]
    async fn test_three_reporting_pages_yield_one_primary() {
        let (hub, _) = hub();
        let browser = FakeBrowser::new();
        let pages: Vec<_> = ["P1", "P2", "P3"].map(|id| browser.add_page(id)).into();
        for page in &pages {
            page.console(&["[WS_CREATED]", SOCKET]);
        }
        for page in &pages {
            hub.watch(browser.as_ref(), &target(page)).await.expect("watch");
        }

        let primary = hub.primary().wait().await.expect("primary");
        eventually(|| pages.iter().all(|p| hub.session(p.target_id()).is_some())).await;
        let primaries = pages.iter().filter(|p| hub.primary().is(p.target_id())).count();
        assert_eq!(primaries, 1);
        assert!(hub.primary_session().is_some_and(|s| *s.target_id() == primary));
    }

    #[tokio::test]
    async fn test_only_primary_frames_are_delivered() {
        let (hub, _) = hub();
        let seen = Arc::new(Mutex::new(Vec::<Message>::new()));
        let sink = Arc::clone(&seen);
        let handler: MessageHandler = Arc::new(move |m| sink.lock().push(m));
        let (dispatcher, _task) = Dispatcher::spawn(handler);
        hub.set_dispatcher(dispatcher);

        let browser = FakeBrowser::new();
        let primary = browser.add_page("P1");
        let other = browser.add_page("P2");
        primary.console(&["[WS_PRIMARY]", SOCKET]);
        hub.watch(browser.as_ref(), &target(&primary)).await.expect("watch");
        hub.watch(browser.as_ref(), &target(&other)).await.expect("watch");
        hub.primary().wait().await.expect("primary");

        let chat = json!({"1": {"2": "c1@goofish", "5": 1700000000000_i64, "10": {"reminderContent": "hi", "senderUserId": "u1"}}});
        let heartbeat_ack = json!({"code": 200, "headers": {"mid": "m-1 0"}});
        other.console(&["[WS_MESSAGE_RECEIVED]", &chat.to_string()]);
        primary.console(&["[WS_MESSAGE_RECEIVED]", &heartbeat_ack.to_string()]);
        primary.console(&["[WS_MESSAGE_RECEIVED]", "not json"]);
        primary.console(&["[WS_MESSAGE_RECEIVED]", &chat.to_string()]);

        eventually(|| !seen.lock().is_empty()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind(), MessageKind::Chat);
        assert_eq!(seen[0].content(), "hi");
    }

    #[tokio::test]
    async fn test_closed_primary_socket_reelects_by_probe() {
        let (hub, state) = hub();
        let browser = FakeBrowser::new();
        let first = browser.add_page("P1");
        let second = browser.add_page("P2");
        first.emit(
            "Network.webSocketCreated",
            json!({"requestId": "r1", "url": SOCKET}),
        );
        hub.watch(browser.as_ref(), &target(&first)).await.expect("watch");
        hub.watch(browser.as_ref(), &target(&second)).await.expect("watch");
        assert_eq!(hub.primary().wait().await, Some(TargetId::new("P1")));

        second.set_probe(probe_hit());
        first.emit("Network.webSocketClosed", json!({"requestId": "other"}));
        first.emit("Network.webSocketClosed", json!({"requestId": "r1"}));

        eventually(|| hub.primary().is(&TargetId::new("P2"))).await;
        assert_eq!(state.get(), ConnectionState::Live);
    }

    #[tokio::test]
    async fn test_destroyed_primary_without_replacement_degrades() {
        let (hub, state) = hub();
        let browser = FakeBrowser::new();
        let page = browser.add_page("P1");
        page.set_probe(probe_hit());
        hub.watch(browser.as_ref(), &target(&page)).await.expect("watch");
        assert!(hub.probe_all().await);

        hub.unwatch(page.target_id()).await;
        assert_eq!(hub.primary().current(), None);
        assert!(!hub.is_watching(page.target_id()));
        assert_eq!(state.get(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn test_fetch_pauses_are_always_continued() {
        let (hub, _) = hub();
        let browser = FakeBrowser::new();
        let page = browser.add_page("P1");
        page.emit(
            "Fetch.requestPaused",
            json!({"requestId": "f1", "request": {"url": "wss://elsewhere.example/"}}),
        );
        page.emit(
            "Fetch.requestPaused",
            json!({"requestId": "f2", "request": {"url": SOCKET}}),
        );
        hub.watch(browser.as_ref(), &target(&page)).await.expect("watch");

        hub.primary().wait().await.expect("primary");
        eventually(|| page.calls_to("Fetch.continueRequest").len() == 2).await;
        let continued = page.calls_to("Fetch.continueRequest");
        assert_eq!(continued[0]["requestId"], "f1");
        assert_eq!(continued[1]["requestId"], "f2");
    }
}
