//! History batch responses (`/r/MessageManager/listUserMessages`).
//!
//! A batch is a reply frame carrying `code: 200` and a `body.userMessageModels`
//! array. Each model is decoded on its own; a broken model never affects its
//! neighbours.

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::codec::{copy_fields, item_id_from_url};
use super::frames::CODE_OK;
use super::message::{Message, MessageKind};

/// Parser for paged history responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryBatchParser;

impl HistoryBatchParser {
    /// Returns `true` if `envelope` is a history batch.
    #[must_use]
    pub fn is_history_batch(envelope: &Value) -> bool {
        envelope.get("code").and_then(Value::as_i64) == Some(CODE_OK)
            && envelope
                .get("body")
                .and_then(Value::as_object)
                .and_then(|body| body.get("userMessageModels"))
                .is_some_and(Value::is_array)
    }

    /// Decodes every usable entry, preserving order.
    ///
    /// Returns an empty vector for anything that is not a batch.
    #[must_use]
    pub fn parse(envelope: &Value) -> Vec<Message> {
        let Some(models) = envelope
            .pointer("/body/userMessageModels")
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        let messages: Vec<Message> = models
            .iter()
            .enumerate()
            .filter_map(|(index, model)| {
                let parsed = parse_model(model);
                if parsed.is_none() {
                    warn!(index, "Skipping undecodable history entry");
                }
                parsed
            })
            .collect();

        info!(
            total = models.len(),
            parsed = messages.len(),
            "Parsed history batch"
        );
        if let Some(cursor) = Self::next_cursor(envelope) {
            debug!(%cursor, "History batch has more pages");
        }
        messages
    }

    /// Returns the cursor for the next page, if the server sent one.
    #[must_use]
    pub fn next_cursor(envelope: &Value) -> Option<String> {
        match envelope.pointer("/body/nextCursor")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn parse_model(model: &Value) -> Option<Message> {
    let message = model.get("message")?.as_object()?;
    let empty = Map::new();
    let extension = message
        .get("extension")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let content = non_empty(extension.get("reminderContent"))
        .or_else(|| non_empty(message.get("searchableContent")?.get("summary")))?;
    let chat_id = non_empty(message.get("cid"))?
        .split('@')
        .next()
        .filter(|id| !id.is_empty())?;

    let sender = non_empty(extension.get("senderUserId"))
        .or_else(|| {
            non_empty(message.get("sender")?.get("uid")).and_then(|uid| uid.split('@').next())
        })
        .unwrap_or_default();

    let timestamp_ms = message
        .get("createAt")
        .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
        .unwrap_or_default();

    let item_id = extension
        .get("reminderUrl")
        .and_then(Value::as_str)
        .and_then(item_id_from_url)
        .map(str::to_string);

    let mut parsed = Message::new(MessageKind::Chat, model.clone())
        .with_chat_id(chat_id)
        .with_user_id(sender)
        .with_content(content)
        .with_timestamp(timestamp_ms)
        .with_item_id(item_id)
        .with_meta("source", "history_api")
        .with_meta(
            "message_id",
            message.get("messageId").cloned().unwrap_or_else(|| Value::from("")),
        )
        .with_meta(
            "read_status",
            model.get("readStatus").cloned().unwrap_or_else(|| Value::from(0)),
        );
    for (key, value) in copy_fields(
        extension,
        &[
            ("reminder_title", "reminderTitle"),
            ("session_type", "sessionType"),
        ],
    ) {
        parsed = parsed.with_meta(key, value);
    }
    Some(parsed)
}

fn non_empty(v: Option<&Value>) -> Option<&str> {
    v?.as_str().filter(|s| !s.is_empty())
}
