//! Chrome DevTools Protocol capability surface.
//!
//! The browser-mediated transport only needs a handful of CDP capabilities,
//! expressed as three traits so tests can substitute in-memory fakes:
//!
//! | Trait | Capability |
//! |-------|------------|
//! | [`BrowserConnector`] | Obtain a browser (attach or launch) |
//! | [`BrowserHandle`] | Enumerate targets, attach sessions, watch target lifecycle |
//! | [`PageSession`] | Send commands to one target and receive its events |
//!
//! [`CdpConnector`] implements them over a single browser WebSocket with
//! flattened sessions.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `client` | Concrete CDP client over `tokio-tungstenite` |
//! | `launcher` | Chromium process launcher |

// ============================================================================
// Submodules
// ============================================================================

/// Concrete CDP client.
pub mod client;

/// Chromium process launcher.
pub mod launcher;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::identifiers::TargetId;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{CdpBrowser, CdpConnector, CdpPage};
pub use launcher::BrowserProcess;

// ============================================================================
// Types
// ============================================================================

/// A CDP event delivered to one session.
#[derive(Debug, Clone, PartialEq)]
pub struct CdpEvent {
    /// Event name, e.g. `Runtime.consoleAPICalled`.
    pub method: String,
    /// Event parameters.
    pub params: Value,
}

/// A page or iframe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTarget {
    /// Browser-assigned id.
    pub id: TargetId,
    /// Target type (`page`, `iframe`, ...).
    pub kind: String,
    /// Current URL.
    pub url: String,
    /// Target that opened this one, for popups.
    pub opener: Option<TargetId>,
}

impl PageTarget {
    /// Returns `true` for targets that run page scripts.
    #[inline]
    #[must_use]
    pub fn is_inspectable(&self) -> bool {
        matches!(self.kind.as_str(), "page" | "iframe")
    }
}

/// Target lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    /// A new page, iframe or popup appeared.
    Created(PageTarget),
    /// An existing target changed URL.
    Navigated(PageTarget),
    /// A target went away.
    Destroyed(TargetId),
}

// ============================================================================
// Traits
// ============================================================================

/// Produces a connected browser.
#[async_trait]
pub trait BrowserConnector: Send + Sync {
    /// Connects to (or launches) a browser.
    ///
    /// # Errors
    ///
    /// Launch or WebSocket failures.
    async fn connect(&self) -> Result<Arc<dyn BrowserHandle>>;
}

/// A connected browser.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Lists current targets.
    ///
    /// # Errors
    ///
    /// CDP or connection failures.
    async fn targets(&self) -> Result<Vec<PageTarget>>;

    /// Opens a session on `target`.
    ///
    /// # Errors
    ///
    /// CDP or connection failures.
    async fn attach(&self, target: &TargetId) -> Result<Arc<dyn PageSession>>;

    /// Sends a browser-level command.
    ///
    /// # Errors
    ///
    /// CDP or connection failures.
    async fn call(&self, method: &str, params: Value) -> Result<Value>;

    /// Takes the target lifecycle stream. Returns `None` after the first call.
    fn take_target_events(&self) -> Option<mpsc::UnboundedReceiver<TargetEvent>>;

    /// Closes the connection and any launched process.
    async fn close(&self);
}

/// A session attached to one target.
#[async_trait]
pub trait PageSession: Send + Sync {
    /// The attached target.
    fn target_id(&self) -> &TargetId;

    /// Sends a command within this session.
    ///
    /// # Errors
    ///
    /// CDP or connection failures.
    async fn call(&self, method: &str, params: Value) -> Result<Value>;

    /// Takes the session's event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CdpEvent>>;

    /// Detaches the session.
    async fn detach(&self);
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Evaluates `expression` in `session` and returns its value.
///
/// Promises are awaited and results are returned by value.
///
/// # Errors
///
/// [`Error::ScriptError`] if the script throws, or the CDP call's error.
pub async fn evaluate(session: &dyn PageSession, expression: &str) -> Result<Value> {
    let response = session
        .call(
            "Runtime.evaluate",
            json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": true,
            }),
        )
        .await?;

    if let Some(details) = response.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("script threw");
        return Err(Error::script_error(message));
    }

    Ok(response
        .pointer("/result/value")
        .cloned()
        .unwrap_or(Value::Null))
}
