//! `lwp` control frames.
//!
//! Every frame on the wire is a JSON object. Client requests carry an `lwp`
//! route and a `headers.mid`; server replies carry `code` and echo the `mid`.
//!
//! | Frame | Direction | Shape |
//! |-------|-----------|-------|
//! | registration | client → server | `{"lwp":"/reg","headers":{token,did,..}}` |
//! | sync-status ack | client → server | `{"lwp":"/r/SyncStatus/ackDiff","body":[..]}` |
//! | heartbeat | client → server | `{"lwp":"/!","headers":{mid}}` |
//! | ACK | client → server | `{"code":200,"headers":{mid,sid,..}}` |
//! | heartbeat ack | server → client | `{"code":200,"headers":{mid}}` (no `body`) |

// ============================================================================
// Imports
// ============================================================================

use serde_json::{Map, Value, json};

use crate::identifiers::{DeviceId, MessageId, now_millis};

// ============================================================================
// Constants
// ============================================================================

/// Route of the registration frame.
pub const LWP_REGISTER: &str = "/reg";

/// Route of the initial sync-status acknowledgement.
pub const LWP_SYNC_ACK: &str = "/r/SyncStatus/ackDiff";

/// Route of the heartbeat frame.
pub const LWP_HEARTBEAT: &str = "/!";

/// Route of outbound chat messages.
pub const LWP_SEND_MESSAGE: &str = "/r/MessageSend/sendByReceiverScope";

/// Success status code.
pub const CODE_OK: i64 = 200;

/// Headers copied from an inbound frame into its ACK when present.
const ECHOED_HEADERS: [&str; 3] = ["app-key", "ua", "dt"];

// ============================================================================
// Registration
// ============================================================================

/// Parameters of the `/reg` handshake frame.
#[derive(Debug, Clone, Copy)]
pub struct Registration<'a> {
    /// IM application key.
    pub app_key: &'a str,
    /// Current access token.
    pub token: &'a str,
    /// IM client user agent.
    pub user_agent: &'a str,
    /// Device id the token was issued for.
    pub device_id: &'a DeviceId,
}

impl Registration<'_> {
    /// Builds the registration frame with a fresh `mid`.
    #[must_use]
    pub fn to_frame(&self) -> Value {
        json!({
            "lwp": LWP_REGISTER,
            "headers": {
                "cache-header": "app-key token ua wv",
                "app-key": self.app_key,
                "token": self.token,
                "ua": self.user_agent,
                "dt": "j",
                "wv": "im:3,au:3,sy:6",
                "sync": "0,0;0;0;",
                "did": self.device_id.as_str(),
                "mid": MessageId::generate().as_str(),
            }
        })
    }
}

/// Builds the sync-status acknowledgement sent right after registration.
#[must_use]
pub fn sync_status_ack() -> Value {
    let now = now_millis();
    json!({
        "lwp": LWP_SYNC_ACK,
        "headers": { "mid": MessageId::generate().as_str() },
        "body": [{
            "pipeline": "sync",
            "tooLong2Tag": "PNM,1",
            "channel": "sync",
            "topic": "sync",
            "highPts": 0,
            "pts": now * 1000,
            "seq": 0,
            "timestamp": now,
        }]
    })
}

/// Builds a minimal heartbeat frame.
#[must_use]
pub fn heartbeat() -> Value {
    json!({
        "lwp": LWP_HEARTBEAT,
        "headers": { "mid": MessageId::generate().as_str() }
    })
}

// ============================================================================
// Inspection
// ============================================================================

/// Returns the frame's `headers.mid`, if any.
#[must_use]
pub fn message_id(frame: &Value) -> Option<MessageId> {
    frame
        .get("headers")?
        .get("mid")?
        .as_str()
        .map(MessageId::from_wire)
}

/// Builds the ACK for an inbound frame, or `None` if it carries no `mid`.
#[must_use]
pub fn ack_for(frame: &Value) -> Option<Value> {
    let headers = frame.get("headers")?.as_object()?;
    let mid = headers.get("mid")?.as_str()?;

    let mut ack_headers = Map::new();
    ack_headers.insert("mid".into(), Value::from(mid));
    ack_headers.insert(
        "sid".into(),
        headers.get("sid").cloned().unwrap_or_else(|| Value::from("")),
    );
    for key in ECHOED_HEADERS {
        if let Some(value) = headers.get(key) {
            ack_headers.insert(key.into(), value.clone());
        }
    }

    Some(json!({ "code": CODE_OK, "headers": ack_headers }))
}

/// Returns `true` for a bare `code: 200` reply: the server's heartbeat ack.
#[must_use]
pub fn is_heartbeat_ack(frame: &Value) -> bool {
    frame.get("code").and_then(Value::as_i64) == Some(CODE_OK)
        && frame.get("body").is_none()
        && message_id(frame).is_some()
}

// ============================================================================
// Tests
// ============================================================================
