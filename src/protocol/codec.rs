//! Envelope classification and outbound encoding.
//!
//! Inbound envelopes are untyped JSON keyed by numeric strings (`"1"`, `"3"`,
//! `"10"`). Classification runs an ordered list of rules. The first rule
//! whose shape is detected decides the [`MessageKind`] and no later rule
//! runs; if that shape then lacks a required field the envelope decodes to
//! `None`.
//!
//! | Priority | Shape | Detected by | Also required |
//! |----------|-------|-------------|---------------|
//! | 1 | chat push | `"1"."10".reminderContent` | `"1"."2"`, `"1"."5"`, `senderUserId` |
//! | 1 | chat send | `lwp = sendByReceiverScope` | `body[0].cid`, `custom.data`, receivers |
//! | 2 | typing | `"1"[0]."1"` contains `@goofish` | |
//! | 3 | system | `"3".needPush == "false"` | |
//! | 4 | order | `"3".redReminder` | `"1"` user |
//! | 5 | sync push | `body.syncPushPackage.data[0].data` (base64 + [`Decrypt`]) | |
//!
//! A sync push is unwrapped once and the rules are reapplied to its inner
//! payload. An inner payload that matches nothing becomes
//! [`MessageKind::Unclassified`]; an outer envelope that matches nothing
//! decodes to `None`.

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, LazyLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::{MessageId, SendUuid};

use super::frames::LWP_SEND_MESSAGE;
use super::message::{Message, MessageKind};

// ============================================================================
// Constants
// ============================================================================

/// Account domain suffix used in conversation and user ids.
const DOMAIN_SUFFIX: &str = "@goofish";

/// `itemId=<digits>` inside reminder URLs.
static ITEM_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"itemId=(\d+)").expect("item id pattern is valid"));

// ============================================================================
// Decrypt
// ============================================================================

/// Failure reported by a [`Decrypt`] implementation.
#[derive(Debug, Error)]
#[error("decrypt failed: {0}")]
pub struct DecryptError(pub String);

/// The vendor payload cipher.
///
/// Deterministic and side-effect free. Input is the base64-decoded
/// sync-push payload, output must be UTF-8 JSON.
pub trait Decrypt: Send + Sync {
    /// Decrypts one payload.
    ///
    /// # Errors
    ///
    /// Any failure; the codec treats it as an unparseable frame.
    fn decrypt(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, DecryptError>;
}

impl<F> Decrypt for F
where
    F: Fn(&[u8]) -> std::result::Result<Vec<u8>, DecryptError> + Send + Sync,
{
    fn decrypt(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, DecryptError> {
        self(payload)
    }
}

/// Passthrough for pushes whose payload is plain base64 JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainPayload;

impl Decrypt for PlainPayload {
    fn decrypt(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, DecryptError> {
        Ok(payload.to_vec())
    }
}

// ============================================================================
// Shapes
// ============================================================================

/// Fields of a matched chat message.
struct ChatFields<'a> {
    chat_id: &'a str,
    sender: &'a str,
    content: Cow<'a, str>,
    timestamp_ms: i64,
    item_id: Option<&'a str>,
    extras: Vec<(&'static str, Value)>,
}

/// Result of a successful structural match.
enum Shape<'a> {
    Chat(ChatFields<'a>),
    Typing {
        chat_id: &'a str,
        user_id: &'a str,
    },
    System {
        content: &'a str,
    },
    Order {
        user_id: &'a str,
        reminder: &'a str,
    },
    SyncPush(&'a str),
}

/// Commits an envelope to one shape.
type Detect = fn(&Value) -> bool;

/// Reads the fields of a detected shape.
type Extract = for<'a> fn(&'a Value) -> Option<Shape<'a>>;

/// One classification rule.
struct Rule {
    name: &'static str,
    detect: Detect,
    extract: Extract,
}

/// Rules in priority order.
const RULES: [Rule; 6] = [
    Rule {
        name: "chat_push",
        detect: is_chat_push,
        extract: extract_chat_push,
    },
    Rule {
        name: "chat_send",
        detect: is_chat_send,
        extract: extract_chat_send,
    },
    Rule {
        name: "typing",
        detect: is_typing,
        extract: extract_typing,
    },
    Rule {
        name: "system",
        detect: is_system,
        extract: extract_system,
    },
    Rule {
        name: "order",
        detect: is_order,
        extract: extract_order,
    },
    Rule {
        name: "sync_push",
        detect: is_sync_push,
        extract: extract_sync_push,
    },
];

/// Outcome of running the rules over one payload.
enum Classified<'a> {
    /// No rule detected its shape.
    Unmatched,
    /// A rule detected its shape but a required field was missing.
    Malformed(&'static str),
    Shape(Shape<'a>),
}

/// Runs `rules` in order; the first detected shape is final.
fn classify<'a>(rules: &[Rule], v: &'a Value) -> Classified<'a> {
    let Some(rule) = rules.iter().find(|rule| (rule.detect)(v)) else {
        return Classified::Unmatched;
    };
    match (rule.extract)(v) {
        Some(shape) => Classified::Shape(shape),
        None => Classified::Malformed(rule.name),
    }
}

// ----------------------------------------------------------------------------
// Detection
// ----------------------------------------------------------------------------

fn is_chat_push(v: &Value) -> bool {
    v.get("1")
        .and_then(Value::as_object)
        .and_then(|head| head.get("10"))
        .and_then(Value::as_object)
        .is_some_and(|ext| ext.contains_key("reminderContent"))
}

fn is_chat_send(v: &Value) -> bool {
    v.get("lwp").and_then(Value::as_str) == Some(LWP_SEND_MESSAGE)
}

fn is_typing(v: &Value) -> bool {
    v.get("1")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|first| first.get("1"))
        .and_then(Value::as_str)
        .is_some_and(|conversation| conversation.contains(DOMAIN_SUFFIX))
}

fn is_system(v: &Value) -> bool {
    v.get("3")
        .and_then(Value::as_object)
        .and_then(|notice| notice.get("needPush"))
        .and_then(Value::as_str)
        == Some("false")
}

fn is_order(v: &Value) -> bool {
    v.get("3")
        .and_then(Value::as_object)
        .is_some_and(|notice| notice.contains_key("redReminder"))
}

fn is_sync_push(v: &Value) -> bool {
    v.pointer("/body/syncPushPackage/data/0/data")
        .is_some_and(Value::is_string)
}

// ----------------------------------------------------------------------------
// Extraction
// ----------------------------------------------------------------------------

fn extract_chat_push(v: &Value) -> Option<Shape<'_>> {
    let head = v.get("1")?.as_object()?;
    let ext = head.get("10")?.as_object()?;
    let content = ext.get("reminderContent")?.as_str()?;
    let sender = ext.get("senderUserId")?.as_str()?;
    let chat_id = strip_domain(head.get("2")?.as_str()?);
    let timestamp_ms = millis(head.get("5")?)?;

    let mut extras = copy_fields(
        ext,
        &[
            ("reminder_title", "reminderTitle"),
            ("session_type", "sessionType"),
        ],
    );
    if let Some(message_id) = head.get("3") {
        extras.push(("message_id", message_id.clone()));
    }

    Some(Shape::Chat(ChatFields {
        chat_id,
        sender,
        content: Cow::Borrowed(content),
        timestamp_ms,
        item_id: ext
            .get("reminderUrl")
            .and_then(Value::as_str)
            .and_then(item_id_from_url),
        extras,
    }))
}

fn extract_chat_send(v: &Value) -> Option<Shape<'_>> {
    let body = v.get("body")?.as_array()?;
    let head = body.first()?;
    let chat_id = strip_domain(head.get("cid")?.as_str()?);
    let data = head.pointer("/content/custom/data")?.as_str()?;
    let text: Value = serde_json::from_slice(&STANDARD.decode(data).ok()?).ok()?;
    let content = text.pointer("/text/text")?.as_str()?.to_string();

    let receivers = body.get(1)?.get("actualReceivers")?.as_array()?;
    let sender = strip_domain(receivers.last()?.as_str()?);
    let recipient = receivers.first()?.as_str().map(strip_domain)?;

    Some(Shape::Chat(ChatFields {
        chat_id,
        sender,
        content: Cow::Owned(content),
        timestamp_ms: head
            .get("uuid")
            .and_then(Value::as_str)
            .and_then(SendUuid::timestamp_ms)
            .unwrap_or_default(),
        item_id: None,
        extras: vec![
            ("direction", Value::from("outbound")),
            ("recipient_id", Value::from(recipient)),
        ],
    }))
}

fn extract_typing(v: &Value) -> Option<Shape<'_>> {
    let first = v.get("1")?.as_array()?.first()?.as_object()?;
    Some(Shape::Typing {
        chat_id: strip_domain(first.get("1")?.as_str()?),
        user_id: first
            .get("2")
            .and_then(Value::as_str)
            .map(strip_domain)
            .unwrap_or_default(),
    })
}

fn extract_system(v: &Value) -> Option<Shape<'_>> {
    Some(Shape::System {
        content: v
            .pointer("/3/reminderContent")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    })
}

fn extract_order(v: &Value) -> Option<Shape<'_>> {
    let reminder = v.get("3")?.get("redReminder")?.as_str()?;
    let user_id = strip_domain(v.get("1")?.as_str()?);
    Some(Shape::Order { user_id, reminder })
}

fn extract_sync_push(v: &Value) -> Option<Shape<'_>> {
    v.pointer("/body/syncPushPackage/data/0/data")?
        .as_str()
        .map(Shape::SyncPush)
}

impl Shape<'_> {
    /// Builds the message for every shape except [`Shape::SyncPush`].
    fn into_message(self, raw: &Value) -> Option<Message> {
        let message = match self {
            Self::Chat(chat) => {
                let mut message = Message::new(MessageKind::Chat, raw.clone())
                    .with_chat_id(chat.chat_id)
                    .with_user_id(chat.sender)
                    .with_content(chat.content)
                    .with_timestamp(chat.timestamp_ms)
                    .with_item_id(chat.item_id.map(str::to_string));
                for (key, value) in chat.extras {
                    message = message.with_meta(key, value);
                }
                message
            }
            Self::Typing { chat_id, user_id } => Message::new(MessageKind::Typing, raw.clone())
                .with_chat_id(chat_id)
                .with_user_id(user_id),
            Self::System { content } => {
                Message::new(MessageKind::System, raw.clone()).with_content(content)
            }
            Self::Order { user_id, reminder } => Message::new(MessageKind::Order, raw.clone())
                .with_user_id(user_id)
                .with_content(reminder)
                .with_meta("red_reminder", reminder),
            Self::SyncPush(_) => return None,
        };
        Some(message)
    }
}

// ============================================================================
// MessageCodec
// ============================================================================

/// Stateless decoder/encoder between envelopes and [`Message`]s.
///
/// Cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct MessageCodec {
    decryptor: Arc<dyn Decrypt>,
}

impl fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec").finish_non_exhaustive()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(Arc::new(PlainPayload))
    }
}

impl MessageCodec {
    /// Creates a codec using `decryptor` for sync-push payloads.
    #[inline]
    #[must_use]
    pub fn new(decryptor: Arc<dyn Decrypt>) -> Self {
        Self { decryptor }
    }

    /// Classifies an envelope.
    ///
    /// Returns `None` when no shape matches or any step of unwrapping fails.
    #[must_use]
    pub fn decode(&self, envelope: &Value) -> Option<Message> {
        match classify(&RULES, envelope) {
            Classified::Unmatched => None,
            Classified::Malformed(shape) => {
                debug!(shape, "Dropping envelope with missing fields");
                None
            }
            Classified::Shape(Shape::SyncPush(payload)) => self.decode_sync_push(payload),
            Classified::Shape(shape) => shape.into_message(envelope),
        }
    }

    /// Parses a text frame and classifies it.
    #[must_use]
    pub fn decode_text(&self, text: &str) -> Option<Message> {
        match serde_json::from_str::<Value>(text) {
            Ok(envelope) => self.decode(&envelope),
            Err(e) => {
                debug!(error = %e, "Dropping non-JSON frame");
                None
            }
        }
    }

    /// Builds an outbound chat envelope.
    ///
    /// Pure: only the fresh `mid` and send uuid vary between calls.
    #[must_use]
    pub fn encode(chat_id: &str, user_id: &str, sender_id: &str, content: &str) -> Value {
        let text = json!({ "contentType": 1, "text": { "text": content } });
        let data = STANDARD.encode(text.to_string());

        json!({
            "lwp": LWP_SEND_MESSAGE,
            "headers": { "mid": MessageId::generate().as_str() },
            "body": [
                {
                    "uuid": SendUuid::generate().as_str(),
                    "cid": format!("{chat_id}{DOMAIN_SUFFIX}"),
                    "conversationType": 1,
                    "content": {
                        "contentType": 101,
                        "custom": { "type": 1, "data": data }
                    },
                    "redPointPolicy": 0,
                    "extension": { "extJson": "{}" },
                    "ctx": { "appVersion": "1.0", "platform": "web" },
                    "mtags": {},
                    "msgReadStatusSetting": 1
                },
                {
                    "actualReceivers": [
                        format!("{user_id}{DOMAIN_SUFFIX}"),
                        format!("{sender_id}{DOMAIN_SUFFIX}"),
                    ]
                }
            ]
        })
    }

    fn decode_sync_push(&self, payload: &str) -> Option<Message> {
        let inner = match self.open_payload(payload) {
            Ok(inner) => inner,
            Err(e) => {
                debug!(error = %e, "Dropping unreadable sync push");
                return None;
            }
        };

        // No second unwrap: the sync-push rule is last and excluded here.
        let message = match classify(&RULES[..RULES.len() - 1], &inner) {
            Classified::Shape(shape) => shape.into_message(&inner)?,
            Classified::Malformed(shape) => {
                debug!(shape, "Dropping sync push with missing fields");
                return None;
            }
            Classified::Unmatched => {
                trace!("Sync push payload matched no shape");
                Message::new(MessageKind::Unclassified, inner.clone())
            }
        };
        Some(message.with_meta("source", "sync_push"))
    }

    fn open_payload(&self, payload: &str) -> Result<Value> {
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::protocol_decode(format!("base64: {e}")))?;
        let plain = self
            .decryptor
            .decrypt(&bytes)
            .map_err(|e| Error::protocol_decode(e.to_string()))?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Drops a trailing `@domain` from a conversation or user id.
fn strip_domain(id: &str) -> &str {
    id.rsplit_once('@').map_or(id, |(head, _)| head)
}

/// Reads a millisecond timestamp stored as a number or a numeric string.
fn millis(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extracts the numeric `itemId` query parameter from a reminder URL.
#[must_use]
pub fn item_id_from_url(url: &str) -> Option<&str> {
    ITEM_ID_PATTERN
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Builds message metadata entries from optional JSON fields.
pub(crate) fn copy_fields(
    source: &Map<String, Value>,
    pairs: &[(&'static str, &str)],
) -> Vec<(&'static str, Value)> {
    pairs
        .iter()
        .filter_map(|(meta_key, field)| source.get(*field).map(|v| (*meta_key, v.clone())))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
