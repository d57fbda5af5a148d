//! Type-safe identifiers.
//!
//! Newtype wrappers keep protocol ids (`mid` headers, device ids, CDP target
//! ids) from being mixed up with each other or with free-form strings.
//!
//! | Type | Format | Source |
//! |------|--------|--------|
//! | [`MessageId`] | `"{0..999}{epoch_ms} 0"` | generated per outbound frame |
//! | [`SendUuid`] | `"-{epoch_ms}1"` | generated per outbound chat message |
//! | [`DeviceId`] | `"{UUID-V4}-{user_id}"` | generated per account |
//! | [`TargetId`] | opaque | assigned by the browser |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Time
// ============================================================================

/// Milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ============================================================================
// MessageId
// ============================================================================

/// The `mid` header carried by every frame.
///
/// Server frames carry their own; ACKs echo it back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generates a fresh id: a random prefix below 1000, the epoch
    /// milliseconds, and the `" 0"` suffix.
    #[must_use]
    pub fn generate() -> Self {
        let random_part = Uuid::new_v4().as_u128() % 1000;
        Self(format!("{random_part}{} 0", now_millis()))
    }

    /// Wraps an id received from the server.
    #[inline]
    #[must_use]
    pub fn from_wire(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// SendUuid
// ============================================================================

/// Client-side uuid attached to outbound chat messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SendUuid(String);

impl SendUuid {
    /// Generates `"-{epoch_ms}1"`.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("-{}1", now_millis()))
    }

    /// Recovers the embedded epoch milliseconds, if well-formed.
    #[must_use]
    pub fn timestamp_ms(raw: &str) -> Option<i64> {
        raw.strip_prefix('-')?.strip_suffix('1')?.parse().ok()
    }

    /// Returns the raw uuid.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SendUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// DeviceId
// ============================================================================

/// Device id sent during registration and token fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generates a device id bound to `user_id`.
    #[must_use]
    pub fn for_user(user_id: &str) -> Self {
        let prefix = Uuid::new_v4().to_string().to_uppercase();
        Self(format!("{prefix}-{user_id}"))
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// TargetId
// ============================================================================

/// CDP target id of a watched page or iframe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    /// Creates a target id.
    #[inline]
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_format() {
        let mid = MessageId::generate();
        assert!(mid.as_str().ends_with(" 0"));
        let digits = mid.as_str().trim_end_matches(" 0");
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
        assert!(digits.len() >= 13);
    }

    #[test]
    fn test_send_uuid_timestamp() {
        let uuid = SendUuid::generate();
        let ts = SendUuid::timestamp_ms(uuid.as_str()).expect("well-formed");
        assert!(ts > 1_600_000_000_000);
        assert_eq!(SendUuid::timestamp_ms("garbage"), None);
    }

    #[test]
    fn test_device_id_suffix() {
        let id = DeviceId::for_user("2200687521877");
        assert!(id.as_str().ends_with("-2200687521877"));
        assert_eq!(id.as_str().len(), 36 + 1 + 13);
        assert_eq!(id.as_str(), id.as_str().to_uppercase());
    }

    #[test]
    fn test_target_id_display() {
        let id = TargetId::new("E3F1");
        assert_eq!(id.to_string(), "E3F1");
    }
}
