//! Test doubles shared by transport tests.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Sink;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::cdp::{BrowserConnector, BrowserHandle, CdpEvent, PageSession, PageTarget, TargetEvent};
use crate::error::Error;
use crate::identifiers::TargetId;

/// Sink that records text frames and close calls.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    frames: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
    fail: bool,
}

impl RecordingSink {
    /// A sink that rejects every frame.
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Sink<WsMessage> for RecordingSink {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsMessage) -> Result<(), WsError> {
        if self.fail {
            return Err(WsError::AlreadyClosed);
        }
        if let WsMessage::Text(text) = item {
            self.frames.lock().push(text.as_str().to_owned());
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// CDP fakes
// ============================================================================

/// Polls `condition` until it holds, failing after about two seconds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// In-memory page session.
///
/// `Runtime.evaluate` answers the probe script with the configured probe
/// report, the iframe injection with the configured iframe report and the
/// send script with the configured send outcome.
pub(crate) struct FakePage {
    id: TargetId,
    calls: Mutex<Vec<(String, Value)>>,
    events_tx: mpsc::UnboundedSender<CdpEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CdpEvent>>>,
    probe: Mutex<Value>,
    iframes: Mutex<Value>,
    send_ok: AtomicBool,
}

impl FakePage {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: TargetId::new(id),
            calls: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            probe: Mutex::new(json!({"found": false})),
            iframes: Mutex::new(json!({"iframeCount": 0, "injectedCount": 0})),
            send_ok: AtomicBool::new(true),
        })
    }

    pub(crate) fn emit(&self, method: &str, params: Value) {
        let _ = self.events_tx.send(CdpEvent {
            method: method.to_string(),
            params,
        });
    }

    /// Emits a `console.log` with string arguments.
    pub(crate) fn console(&self, args: &[&str]) {
        let args: Vec<Value> = args
            .iter()
            .map(|a| json!({"type": "string", "value": a}))
            .collect();
        self.emit("Runtime.consoleAPICalled", json!({"type": "log", "args": args}));
    }

    pub(crate) fn set_probe(&self, report: Value) {
        *self.probe.lock() = report;
    }

    pub(crate) fn set_iframe_report(&self, report: Value) {
        *self.iframes.lock() = report;
    }

    pub(crate) fn set_send_ok(&self, ok: bool) {
        self.send_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub(crate) fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl PageSession for FakePage {
    fn target_id(&self) -> &TargetId {
        &self.id
    }

    async fn call(&self, method: &str, params: Value) -> crate::error::Result<Value> {
        self.calls.lock().push((method.to_string(), params.clone()));
        if method != "Runtime.evaluate" {
            return Ok(json!({}));
        }
        let expression = params["expression"].as_str().unwrap_or_default();
        let value = if expression.contains("'window_scan'") {
            self.probe.lock().clone()
        } else if expression.contains("injectedCount") {
            self.iframes.lock().clone()
        } else if expression.contains("sent_via_primary") {
            json!({"success": self.send_ok.load(Ordering::SeqCst), "message": "fake"})
        } else {
            Value::Null
        };
        Ok(json!({"result": {"type": "object", "value": value}}))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CdpEvent>> {
        self.events_rx.lock().take()
    }

    async fn detach(&self) {}
}

/// In-memory browser holding [`FakePage`]s.
pub(crate) struct FakeBrowser {
    pages: Mutex<FxHashMap<TargetId, Arc<FakePage>>>,
    order: Mutex<Vec<TargetId>>,
    calls: Mutex<Vec<(String, Value)>>,
    target_tx: mpsc::UnboundedSender<TargetEvent>,
    target_rx: Mutex<Option<mpsc::UnboundedReceiver<TargetEvent>>>,
    closes: AtomicUsize,
}

impl FakeBrowser {
    pub(crate) fn new() -> Arc<Self> {
        let (target_tx, target_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pages: Mutex::new(FxHashMap::default()),
            order: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            target_tx,
            target_rx: Mutex::new(Some(target_rx)),
            closes: AtomicUsize::new(0),
        })
    }

    pub(crate) fn add_page(&self, id: &str) -> Arc<FakePage> {
        let page = FakePage::new(id);
        self.pages.lock().insert(page.id.clone(), Arc::clone(&page));
        self.order.lock().push(page.id.clone());
        page
    }

    /// Adds a page after connect and announces it.
    pub(crate) fn open_page(&self, id: &str) -> Arc<FakePage> {
        let page = self.add_page(id);
        let _ = self.target_tx.send(TargetEvent::Created(page_target(id)));
        page
    }

    pub(crate) fn destroy_page(&self, id: &str) {
        let id = TargetId::new(id);
        self.pages.lock().remove(&id);
        self.order.lock().retain(|t| *t != id);
        let _ = self.target_tx.send(TargetEvent::Destroyed(id));
    }

    pub(crate) fn page(&self, id: &str) -> Option<Arc<FakePage>> {
        self.pages.lock().get(&TargetId::new(id)).cloned()
    }

    pub(crate) fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

fn page_target(id: &str) -> PageTarget {
    PageTarget {
        id: TargetId::new(id),
        kind: "page".into(),
        url: "about:blank".into(),
        opener: None,
    }
}

#[async_trait]
impl BrowserHandle for FakeBrowser {
    async fn targets(&self) -> crate::error::Result<Vec<PageTarget>> {
        Ok(self
            .order
            .lock()
            .iter()
            .map(|id| page_target(id.as_str()))
            .collect())
    }

    async fn attach(&self, target: &TargetId) -> crate::error::Result<Arc<dyn PageSession>> {
        let page = self
            .pages
            .lock()
            .get(target)
            .cloned()
            .ok_or_else(|| Error::cdp(-32602, "No target with given id found"))?;
        Ok(page as Arc<dyn PageSession>)
    }

    async fn call(&self, method: &str, params: Value) -> crate::error::Result<Value> {
        self.calls.lock().push((method.to_string(), params));
        if method == "Target.createTarget" {
            let id = format!("NEW{}", self.order.lock().len());
            self.add_page(&id);
            return Ok(json!({"targetId": id}));
        }
        Ok(json!({}))
    }

    fn take_target_events(&self) -> Option<mpsc::UnboundedReceiver<TargetEvent>> {
        self.target_rx.lock().take()
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one shared [`FakeBrowser`].
pub(crate) struct FakeConnector(pub(crate) Arc<FakeBrowser>);

#[async_trait]
impl BrowserConnector for FakeConnector {
    async fn connect(&self) -> crate::error::Result<Arc<dyn BrowserHandle>> {
        Ok(Arc::clone(&self.0) as Arc<dyn BrowserHandle>)
    }
}
