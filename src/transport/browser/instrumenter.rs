//! Page instrumentation and event interpretation.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cdp::{CdpEvent, PageSession, evaluate};
use crate::error::Result;

use super::scripts::PageScripts;

// ============================================================================
// Signals
// ============================================================================

/// How a socket came to be known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionChannel {
    /// Interceptor console output.
    Console,
    /// `Network.*` events.
    Network,
    /// `Fetch.requestPaused`.
    Fetch,
    /// Active probe script.
    Probe,
}

impl fmt::Display for DetectionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Console => "console",
            Self::Network => "network",
            Self::Fetch => "fetch",
            Self::Probe => "probe",
        };
        f.write_str(name)
    }
}

/// What a page event means for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSignal {
    /// The interceptor is installed in the page.
    InterceptorReady,
    /// A WebSocket was seen. Not yet filtered by host.
    SocketDetected {
        url: String,
        request_id: Option<String>,
        via: DetectionChannel,
    },
    /// The page's socket received a frame.
    FrameReceived(String),
    /// The page's socket sent a frame.
    FrameSent(String),
    /// A network-tracked socket closed.
    SocketClosed { request_id: String },
    /// The send script reported an error.
    SendError(String),
    /// A request is held by `Fetch` and must be continued.
    FetchPaused { request_id: String, url: String },
}

/// Result of a successful probe.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeHit {
    /// Socket URL.
    pub url: String,
    /// `WebSocket.readyState`, `-1` when found through performance entries.
    #[serde(default = "unknown_ready_state")]
    pub ready_state: i64,
    /// Detection method (`injected`, `performance`, `window_scan`).
    #[serde(default)]
    pub method: String,
    /// Frame the socket lives in.
    #[serde(default)]
    pub frame_name: String,
}

const fn unknown_ready_state() -> i64 {
    -1
}

impl ProbeHit {
    /// `false` once the socket is closing or closed.
    #[inline]
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !matches!(self.ready_state, 2 | 3)
    }
}

// ============================================================================
// PageInstrumenter
// ============================================================================

/// Prepares pages and reads their events.
///
/// The passive half is [`interpret`](Self::interpret), the active half is
/// [`probe`](Self::probe).
#[async_trait]
pub trait PageInstrumenter: Send + Sync {
    /// Enables domains and installs the interceptor.
    ///
    /// # Errors
    ///
    /// A required CDP command failed.
    async fn instrument(&self, session: &dyn PageSession) -> Result<()>;

    /// Re-runs the interceptor after a navigation.
    ///
    /// # Errors
    ///
    /// The evaluation failed.
    async fn reinject(&self, session: &dyn PageSession) -> Result<()>;

    /// Maps a CDP event to a signal.
    fn interpret(&self, event: &CdpEvent) -> Option<PageSignal>;

    /// Looks for a live target socket in the page and its iframes.
    ///
    /// # Errors
    ///
    /// The evaluation failed.
    async fn probe(&self, session: &dyn PageSession) -> Result<Option<ProbeHit>>;
}

// ============================================================================
// ScriptInstrumenter
// ============================================================================

/// Instrumenter built on the interceptor scripts.
#[derive(Debug, Clone)]
pub struct ScriptInstrumenter {
    scripts: PageScripts,
    enable_fetch: bool,
}

impl ScriptInstrumenter {
    /// Creates an instrumenter watching `target_hosts`.
    #[must_use]
    pub fn new(target_hosts: &[String], enable_fetch: bool) -> Self {
        Self {
            scripts: PageScripts::new(target_hosts),
            enable_fetch,
        }
    }

    async fn inject_now(&self, session: &dyn PageSession) -> Result<()> {
        evaluate(session, &self.scripts.interceptor).await?;
        match evaluate(session, &self.scripts.iframe_injection).await {
            Ok(report) => {
                let frames = report.get("iframeCount").and_then(Value::as_u64).unwrap_or(0);
                let injected = report.get("injectedCount").and_then(Value::as_u64).unwrap_or(0);
                if frames > 0 {
                    debug!(
                        target_id = %session.target_id(),
                        frames,
                        injected,
                        "Interceptor injected into iframes"
                    );
                }
            }
            Err(e) => debug!(target_id = %session.target_id(), error = %e, "Iframe injection failed"),
        }
        Ok(())
    }
}

#[async_trait]
impl PageInstrumenter for ScriptInstrumenter {
    async fn instrument(&self, session: &dyn PageSession) -> Result<()> {
        for domain in ["Network.enable", "Page.enable", "Runtime.enable"] {
            session.call(domain, json!({})).await?;
        }

        if self.enable_fetch {
            let patterns = json!({
                "patterns": [
                    { "urlPattern": "*wss://*", "requestStage": "Request" },
                    { "urlPattern": "*ws://*", "requestStage": "Request" },
                ]
            });
            if let Err(e) = session.call("Fetch.enable", patterns).await {
                warn!(target_id = %session.target_id(), error = %e, "Fetch interception unavailable");
            }
        }

        session
            .call(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": self.scripts.interceptor }),
            )
            .await?;

        if let Err(e) = self.inject_now(session).await {
            warn!(target_id = %session.target_id(), error = %e, "Interceptor not applied to current document");
        }
        debug!(target_id = %session.target_id(), "Page instrumented");
        Ok(())
    }

    async fn reinject(&self, session: &dyn PageSession) -> Result<()> {
        self.inject_now(session).await
    }

    fn interpret(&self, event: &CdpEvent) -> Option<PageSignal> {
        let params = &event.params;
        match event.method.as_str() {
            "Runtime.consoleAPICalled" => interpret_console(params),
            "Network.webSocketCreated" | "Network.requestWillBeSent" => {
                let url = params
                    .get("url")
                    .or_else(|| params.pointer("/request/url"))
                    .and_then(Value::as_str)?;
                if !is_socket_url(url) {
                    return None;
                }
                Some(PageSignal::SocketDetected {
                    url: url.to_string(),
                    request_id: string_field(params, "requestId"),
                    via: DetectionChannel::Network,
                })
            }
            "Network.webSocketClosed" => Some(PageSignal::SocketClosed {
                request_id: string_field(params, "requestId")?,
            }),
            "Fetch.requestPaused" => Some(PageSignal::FetchPaused {
                request_id: string_field(params, "requestId")?,
                url: params
                    .pointer("/request/url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            _ => None,
        }
    }

    async fn probe(&self, session: &dyn PageSession) -> Result<Option<ProbeHit>> {
        let report = evaluate(session, &self.scripts.probe).await?;
        if !report.get("found").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(None);
        }
        Ok(serde_json::from_value(report).ok())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn interpret_console(params: &Value) -> Option<PageSignal> {
    let args: Vec<String> = params
        .get("args")
        .and_then(Value::as_array)?
        .iter()
        .map(console_arg)
        .collect();
    let (marker, rest) = args.split_first()?;
    let arg = |i: usize| rest.get(i).cloned();

    match params.get("type").and_then(Value::as_str) {
        Some("error") if marker == "[CDP_SEND_ERROR]" => {
            Some(PageSignal::SendError(arg(0).unwrap_or_default()))
        }
        Some("log") => match marker.as_str() {
            "[WS_INTERCEPTOR_READY]" => Some(PageSignal::InterceptorReady),
            "[WS_PRIMARY]" | "[WS_CREATED]" | "[WS_OPENED]" => Some(PageSignal::SocketDetected {
                url: arg(0)?,
                request_id: None,
                via: DetectionChannel::Console,
            }),
            "[WS_CREATED_IN_IFRAME]" => Some(PageSignal::SocketDetected {
                url: arg(1)?,
                request_id: None,
                via: DetectionChannel::Console,
            }),
            "[WS_MESSAGE_RECEIVED]" => Some(PageSignal::FrameReceived(arg(0)?)),
            "[WS_MESSAGE_SENT]" => Some(PageSignal::FrameSent(arg(0)?)),
            _ => None,
        },
        _ => None,
    }
}

/// Text of a `Runtime.RemoteObject` console argument.
fn console_arg(arg: &Value) -> String {
    match arg.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => arg
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(other) => other.to_string(),
    }
}

fn string_field(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn is_socket_url(url: &str) -> bool {
    url.starts_with("wss://") || url.starts_with("ws://")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::testing::FakePage;

    fn instrumenter(fetch: bool) -> ScriptInstrumenter {
        ScriptInstrumenter::new(&["wss-goofish.dingtalk.com".to_string()], fetch)
    }

    fn console(kind: &str, args: &[Value]) -> CdpEvent {
        CdpEvent {
            method: "Runtime.consoleAPICalled".into(),
            params: json!({ "type": kind, "args": args }),
        }
    }

    #[test]
    fn test_console_markers() {
        let ins = instrumenter(true);
        let url = "wss://wss-goofish.dingtalk.com/";

        assert_eq!(
            ins.interpret(&console("log", &[json!({"value": "[WS_PRIMARY]"}), json!({"value": url})])),
            Some(PageSignal::SocketDetected {
                url: url.into(),
                request_id: None,
                via: DetectionChannel::Console
            })
        );
        assert_eq!(
            ins.interpret(&console(
                "log",
                &[
                    json!({"value": "[WS_CREATED_IN_IFRAME]"}),
                    json!({"value": "im"}),
                    json!({"value": url})
                ]
            )),
            Some(PageSignal::SocketDetected {
                url: url.into(),
                request_id: None,
                via: DetectionChannel::Console
            })
        );
        assert_eq!(
            ins.interpret(&console("log", &[json!({"value": "[WS_MESSAGE_RECEIVED]"}), json!({"value": "{}"})])),
            Some(PageSignal::FrameReceived("{}".into()))
        );
        assert_eq!(
            ins.interpret(&console(
                "error",
                &[json!({"value": "[CDP_SEND_ERROR]"}), json!({"type": "object", "description": "TypeError: x"})]
            )),
            Some(PageSignal::SendError("TypeError: x".into()))
        );
        assert_eq!(ins.interpret(&console("log", &[json!({"value": 42})])), None);
        assert_eq!(ins.interpret(&console("log", &[json!({"value": "[WS_CREATED]"})])), None);
    }

    #[test]
    fn test_network_and_fetch_events() {
        let ins = instrumenter(true);
        let created = CdpEvent {
            method: "Network.webSocketCreated".into(),
            params: json!({"requestId": "r1", "url": "wss://wss.goofish.com/x"}),
        };
        assert!(matches!(
            ins.interpret(&created),
            Some(PageSignal::SocketDetected { via: DetectionChannel::Network, request_id: Some(ref id), .. }) if id == "r1"
        ));

        let http = CdpEvent {
            method: "Network.requestWillBeSent".into(),
            params: json!({"requestId": "r2", "request": {"url": "https://www.goofish.com/"}}),
        };
        assert_eq!(ins.interpret(&http), None);

        let paused = CdpEvent {
            method: "Fetch.requestPaused".into(),
            params: json!({"requestId": "f1", "request": {"url": "wss://a/"}}),
        };
        assert_eq!(
            ins.interpret(&paused),
            Some(PageSignal::FetchPaused {
                request_id: "f1".into(),
                url: "wss://a/".into()
            })
        );
    }

    #[tokio::test]
    async fn test_instrument_enables_domains_and_registers_script() {
        let page = FakePage::new("P1");
        instrumenter(true).instrument(page.as_ref()).await.expect("instrument");

        let methods = page.methods();
        assert_eq!(&methods[..3], ["Network.enable", "Page.enable", "Runtime.enable"]);
        assert!(methods.contains(&"Fetch.enable".to_string()));
        assert!(methods.contains(&"Page.addScriptToEvaluateOnNewDocument".to_string()));
        assert_eq!(methods.iter().filter(|m| *m == "Runtime.evaluate").count(), 2);

        let page = FakePage::new("P2");
        instrumenter(false).instrument(page.as_ref()).await.expect("instrument");
        assert!(!page.methods().contains(&"Fetch.enable".to_string()));
    }

    #[tokio::test]
    async fn test_instrument_reports_iframe_injection() {
        let page = FakePage::new("P1");
        page.set_iframe_report(json!({"iframeCount": 2, "injectedCount": 1}));
        instrumenter(true).instrument(page.as_ref()).await.expect("instrument");

        let expressions: Vec<String> = page
            .calls_to("Runtime.evaluate")
            .iter()
            .filter_map(|p| p["expression"].as_str().map(str::to_string))
            .collect();
        assert!(expressions.iter().any(|e| e.contains("injectedCount")));
    }

    #[tokio::test]
    async fn test_probe_reports_hit() {
        let page = FakePage::new("P1");
        let ins = instrumenter(true);
        assert_eq!(ins.probe(page.as_ref()).await.expect("probe"), None);

        page.set_probe(json!({
            "found": true,
            "url": "wss://wss-goofish.dingtalk.com/",
            "readyState": 1,
            "method": "injected",
            "frameName": "main"
        }));
        let hit = ins.probe(page.as_ref()).await.expect("probe").expect("hit");
        assert_eq!(hit.method, "injected");
        assert!(hit.is_usable());
    }
}
