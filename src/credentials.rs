//! Account credentials derived from a browser cookie string.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::identifiers::DeviceId;

// ============================================================================
// Constants
// ============================================================================

/// Cookie holding the logged-in account's user id.
const USER_ID_COOKIE: &str = "unb";

// ============================================================================
// Credentials
// ============================================================================

/// Cookies plus the identities derived from them.
///
/// The raw cookie string is replayed verbatim on the WebSocket upgrade; the
/// parsed pairs are injected into the browser in browser mode.
#[derive(Debug, Clone)]
pub struct Credentials {
    raw: String,
    cookies: FxHashMap<String, String>,
    user_id: String,
    device_id: DeviceId,
}

impl Credentials {
    /// Parses a `name=value; name2=value2` cookie string.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the string has no `unb` cookie.
    pub fn from_cookie_str(raw: &str) -> Result<Self> {
        let cookies = parse_cookies(raw);
        let user_id = cookies
            .get(USER_ID_COOKIE)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::config("cookie string has no `unb` entry"))?;
        let device_id = DeviceId::for_user(&user_id);

        Ok(Self {
            raw: raw.trim().to_string(),
            cookies,
            user_id,
            device_id,
        })
    }

    /// The raw cookie header value.
    #[inline]
    #[must_use]
    pub fn cookie_header(&self) -> &str {
        &self.raw
    }

    /// The logged-in account's user id (the seller).
    #[inline]
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Device id bound to this account for the lifetime of the process.
    #[inline]
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Iterates over parsed cookie pairs.
    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Splits a cookie header into pairs. Later duplicates win.
fn parse_cookies(raw: &str) -> FxHashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extracts_user_id() {
        let creds = Credentials::from_cookie_str("cna=abc; unb=2200687521877; _m_h5_tk=tk_1;")
            .expect("valid cookies");
        assert_eq!(creds.user_id(), "2200687521877");
        assert!(creds.device_id().as_str().ends_with("-2200687521877"));
        assert_eq!(creds.cookies().count(), 3);
    }

    #[test]
    fn test_value_may_contain_equals() {
        let creds = Credentials::from_cookie_str("unb=1; sgcookie=E100a==").expect("valid");
        let sg = creds.cookies().find(|(k, _)| *k == "sgcookie").map(|(_, v)| v);
        assert_eq!(sg, Some("E100a=="));
    }

    #[test]
    fn test_missing_unb_is_config_error() {
        let err = Credentials::from_cookie_str("cna=abc").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_empty_unb_is_config_error() {
        assert!(Credentials::from_cookie_str("unb=; cna=abc").is_err());
    }
}
