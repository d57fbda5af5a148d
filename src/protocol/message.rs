//! Typed domain messages.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

// ============================================================================
// MessageKind
// ============================================================================

/// Classification derived from envelope shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A user chat message.
    Chat,
    /// "User is typing" status.
    Typing,
    /// System notice that is not pushed to the user.
    System,
    /// Order status change (payment, shipping, closure).
    Order,
    /// Decrypted push whose inner payload matched no known shape.
    Unclassified,
}

impl MessageKind {
    /// Returns `true` if messages of this kind are delivered to callbacks.
    #[inline]
    #[must_use]
    pub const fn is_deliverable(self) -> bool {
        !matches!(self, Self::Unclassified)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chat => "chat",
            Self::Typing => "typing",
            Self::System => "system",
            Self::Order => "order",
            Self::Unclassified => "unclassified",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Message
// ============================================================================

/// A normalized inbound message.
///
/// Only the codec and the history parser construct messages, so `kind`
/// always reflects the shape that was actually matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    kind: MessageKind,
    chat_id: String,
    user_id: String,
    item_id: Option<String>,
    content: String,
    timestamp_ms: i64,
    raw: Value,
    metadata: Map<String, Value>,
}

impl Message {
    pub(crate) fn new(kind: MessageKind, raw: Value) -> Self {
        Self {
            kind,
            chat_id: String::new(),
            user_id: String::new(),
            item_id: None,
            content: String::new(),
            timestamp_ms: 0,
            raw,
            metadata: Map::new(),
        }
    }

    pub(crate) fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = chat_id.into();
        self
    }

    pub(crate) fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub(crate) fn with_item_id(mut self, item_id: Option<String>) -> Self {
        self.item_id = item_id;
        self
    }

    pub(crate) fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub(crate) fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub(crate) fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Shape-derived classification.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Conversation id without the `@goofish` suffix. Empty for orders.
    #[inline]
    #[must_use]
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Sender (or, for orders, buyer) user id.
    #[inline]
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Listing the conversation is about, when known.
    #[inline]
    #[must_use]
    pub fn item_id(&self) -> Option<&str> {
        self.item_id.as_deref()
    }

    /// Text content.
    #[inline]
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Server timestamp in epoch milliseconds, `0` when absent.
    #[inline]
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// The payload the message was decoded from.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Shape-specific extras.
    #[inline]
    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

// ============================================================================
// Tests
// ============================================================================
