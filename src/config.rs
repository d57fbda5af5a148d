//! Transport and supervisor configuration.
//!
//! Every option struct has compiled-in defaults, fluent `with_*` setters,
//! and a loader that overlays environment variables.
//!
//! # Environment
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `COOKIES_STR` | [`Settings::credentials`] | required |
//! | `USE_BROWSER_MODE` | [`Settings::mode`] | `false` |
//! | `HEARTBEAT_INTERVAL` | [`DirectOptions::heartbeat_interval`] | 15s |
//! | `HEARTBEAT_TIMEOUT` | [`DirectOptions::heartbeat_timeout`] | 5s |
//! | `TOKEN_REFRESH_INTERVAL` | [`DirectOptions::token_refresh_interval`] | 3600s |
//! | `TOKEN_RETRY_INTERVAL` | [`DirectOptions::token_retry_interval`] | 300s |
//! | `BROWSER_CDP_URL` | [`BrowserEndpoint::DevTools`] | unset |
//! | `BROWSER_BINARY` | [`BrowserEndpoint::Launch`] | `chromium` |
//! | `BROWSER_HEADLESS` | [`LaunchOptions::headless`] | `false` |
//! | `BROWSER_DEBUG_PORT` | [`LaunchOptions::debug_port`] | random |
//! | `BROWSER_USER_DATA_DIR` | [`LaunchOptions::user_data_dir`] | temporary |
//! | `BROWSER_VIEWPORT_WIDTH` / `_HEIGHT` | [`LaunchOptions::window_size`] | 1280x720 |
//! | `BROWSER_PROXY` | [`LaunchOptions::proxy`] | unset |

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::credentials::Credentials;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// IM gateway endpoint.
pub const DEFAULT_WS_URL: &str = "wss://wss-goofish.dingtalk.com/";

/// IM application key sent at registration.
pub const DEFAULT_APP_KEY: &str = "444e9908a51d1cb236a27862abc769c9";

/// Browser user agent replayed on the WebSocket upgrade.
pub const DEFAULT_BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";

/// IM client user agent sent at registration.
pub const DEFAULT_IM_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 \
     DingTalk(2.1.5) OS(Windows/10) Browser(Chrome/133.0.0.0) DingWeb/2.1.5 \
     IMPaaS DingWeb/2.1.5";

/// Web origin of the marketplace.
pub const DEFAULT_ORIGIN: &str = "https://www.goofish.com";

/// Page the browser opens before detection starts.
pub const DEFAULT_START_URL: &str = "https://www.goofish.com/";

/// Cookie domain used when injecting credentials into the browser.
pub const DEFAULT_COOKIE_DOMAIN: &str = ".goofish.com";

/// Hosts whose WebSockets carry the IM protocol.
pub const DEFAULT_TARGET_HOSTS: [&str; 3] = [
    "wss-goofish.dingtalk.com",
    "msgacs.m.taobao.com",
    "wss.goofish.com",
];

// ============================================================================
// DirectOptions
// ============================================================================

/// Options for the direct protocol client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectOptions {
    /// WebSocket endpoint.
    pub ws_url: String,
    /// IM application key.
    pub app_key: String,
    /// User agent sent inside the `/reg` frame.
    pub im_user_agent: String,
    /// User agent sent on the HTTP upgrade.
    pub browser_user_agent: String,
    /// `Origin` header on the HTTP upgrade.
    pub origin: String,
    /// Time between heartbeats.
    pub heartbeat_interval: Duration,
    /// Extra silence tolerated after a missed heartbeat ack.
    pub heartbeat_timeout: Duration,
    /// Resolution of the heartbeat watchdog.
    pub watchdog_tick: Duration,
    /// Age after which the access token is replaced.
    pub token_refresh_interval: Duration,
    /// Delay before retrying a failed token fetch.
    pub token_retry_interval: Duration,
    /// Bound on the TCP + TLS + upgrade handshake.
    pub connect_timeout: Duration,
    /// Pause between `/reg` and the sync-status ack.
    pub registration_settle: Duration,
}

impl Default for DirectOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectOptions {
    /// Creates options with production defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            app_key: DEFAULT_APP_KEY.to_string(),
            im_user_agent: DEFAULT_IM_USER_AGENT.to_string(),
            browser_user_agent: DEFAULT_BROWSER_USER_AGENT.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(5),
            watchdog_tick: Duration::from_secs(1),
            token_refresh_interval: Duration::from_secs(3600),
            token_retry_interval: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(20),
            registration_settle: Duration::from_secs(1),
        }
    }

    /// Overlays the heartbeat and token variables.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if a variable is set but not a whole number of seconds.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::new();
        Ok(Self {
            heartbeat_interval: secs_or(lookup, "HEARTBEAT_INTERVAL", defaults.heartbeat_interval)?,
            heartbeat_timeout: secs_or(lookup, "HEARTBEAT_TIMEOUT", defaults.heartbeat_timeout)?,
            token_refresh_interval: secs_or(
                lookup,
                "TOKEN_REFRESH_INTERVAL",
                defaults.token_refresh_interval,
            )?,
            token_retry_interval: secs_or(
                lookup,
                "TOKEN_RETRY_INTERVAL",
                defaults.token_retry_interval,
            )?,
            ..defaults
        })
    }

    /// Sets the WebSocket endpoint.
    #[inline]
    #[must_use]
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    /// Sets heartbeat interval and ack timeout.
    #[inline]
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the watchdog tick.
    #[inline]
    #[must_use]
    pub fn with_watchdog_tick(mut self, tick: Duration) -> Self {
        self.watchdog_tick = tick;
        self
    }

    /// Sets token refresh and retry intervals.
    #[inline]
    #[must_use]
    pub fn with_token_intervals(mut self, refresh: Duration, retry: Duration) -> Self {
        self.token_refresh_interval = refresh;
        self.token_retry_interval = retry;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the post-registration settle delay.
    #[inline]
    #[must_use]
    pub fn with_registration_settle(mut self, settle: Duration) -> Self {
        self.registration_settle = settle;
        self
    }

    /// Silence after which the connection is considered dead.
    #[inline]
    #[must_use]
    pub fn ack_deadline(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_timeout
    }

    /// Checks that the endpoint is a WebSocket URL.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a malformed or non-`ws(s)` URL.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.ws_url)
            .map_err(|e| Error::config(format!("invalid ws_url {}: {e}", self.ws_url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "ws_url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        if self.watchdog_tick.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(Error::config("heartbeat interval and tick must be non-zero"));
        }
        Ok(())
    }
}

// ============================================================================
// Browser options
// ============================================================================

/// Where the browser comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEndpoint {
    /// Attach to a running browser's DevTools WebSocket.
    DevTools(String),
    /// Launch a Chromium-family binary.
    Launch(LaunchOptions),
}

/// Options for launching a browser process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Path or name of the browser binary.
    pub binary: PathBuf,
    /// Run without a window.
    pub headless: bool,
    /// Fixed remote-debugging port; a random one when `None`.
    pub debug_port: Option<u16>,
    /// Persistent profile directory; a temporary one when `None`.
    pub user_data_dir: Option<PathBuf>,
    /// Window size in pixels.
    pub window_size: (u32, u32),
    /// Proxy server passed to the browser.
    pub proxy: Option<String>,
    /// Additional command-line arguments.
    pub extra_args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self::new("chromium")
    }
}

impl LaunchOptions {
    /// Creates launch options for `binary`.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            headless: false,
            debug_port: None,
            user_data_dir: None,
            window_size: (1280, 720),
            proxy: None,
            extra_args: Vec::new(),
        }
    }

    /// Enables headless mode.
    #[inline]
    #[must_use]
    pub fn with_headless(mut self) -> Self {
        self.headless = true;
        self
    }

    /// Uses a fixed remote-debugging port.
    #[inline]
    #[must_use]
    pub fn with_debug_port(mut self, port: u16) -> Self {
        self.debug_port = Some(port);
        self
    }

    /// Uses a persistent profile directory.
    #[inline]
    #[must_use]
    pub fn with_user_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_data_dir = Some(dir.into());
        self
    }

    /// Adds a custom command-line argument.
    #[inline]
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

/// Options for the browser-mediated transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserOptions {
    /// Browser to attach to or launch.
    pub endpoint: BrowserEndpoint,
    /// Hosts whose sockets are eligible to become primary.
    pub target_hosts: Vec<String>,
    /// Period of the active probe.
    pub detection_interval: Duration,
    /// How long `connect` waits for a primary.
    pub detection_timeout: Duration,
    /// Page to open after connecting; `None` leaves tabs untouched.
    pub start_url: Option<String>,
    /// Pause WebSocket requests through the Fetch domain.
    pub enable_fetch: bool,
    /// Inject account cookies before navigating.
    pub inject_cookies: bool,
    /// Domain used for injected cookies.
    pub cookie_domain: String,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self::new(BrowserEndpoint::Launch(LaunchOptions::default()))
    }
}

impl BrowserOptions {
    /// Creates options for `endpoint` with default detection settings.
    #[must_use]
    pub fn new(endpoint: BrowserEndpoint) -> Self {
        Self {
            endpoint,
            target_hosts: DEFAULT_TARGET_HOSTS.iter().map(|h| (*h).to_string()).collect(),
            detection_interval: Duration::from_secs(5),
            detection_timeout: Duration::from_secs(30),
            start_url: Some(DEFAULT_START_URL.to_string()),
            enable_fetch: true,
            inject_cookies: true,
            cookie_domain: DEFAULT_COOKIE_DOMAIN.to_string(),
        }
    }

    /// Reads the `BROWSER_*` variables.
    ///
    /// `BROWSER_CDP_URL` selects attach mode; otherwise a browser is launched.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for malformed numbers or URLs.
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("BROWSER_CDP_URL").filter(|u| !u.trim().is_empty()) {
            Url::parse(url.trim())
                .map_err(|e| Error::config(format!("invalid BROWSER_CDP_URL: {e}")))?;
            return Ok(Self::new(BrowserEndpoint::DevTools(url.trim().to_string())));
        }

        let mut launch = LaunchOptions::new(
            lookup("BROWSER_BINARY").unwrap_or_else(|| "chromium".to_string()),
        );
        launch.headless = flag(lookup, "BROWSER_HEADLESS");
        launch.debug_port = parse_opt(lookup, "BROWSER_DEBUG_PORT")?;
        launch.user_data_dir = lookup("BROWSER_USER_DATA_DIR").map(PathBuf::from);
        launch.window_size = (
            parse_opt(lookup, "BROWSER_VIEWPORT_WIDTH")?.unwrap_or(launch.window_size.0),
            parse_opt(lookup, "BROWSER_VIEWPORT_HEIGHT")?.unwrap_or(launch.window_size.1),
        );
        launch.proxy = lookup("BROWSER_PROXY").filter(|p| !p.is_empty());

        Ok(Self::new(BrowserEndpoint::Launch(launch)))
    }

    /// Sets the detection probe period and the connect deadline.
    #[inline]
    #[must_use]
    pub fn with_detection(mut self, interval: Duration, timeout: Duration) -> Self {
        self.detection_interval = interval;
        self.detection_timeout = timeout;
        self
    }

    /// Sets the page opened after connecting.
    #[inline]
    #[must_use]
    pub fn with_start_url(mut self, url: Option<String>) -> Self {
        self.start_url = url;
        self
    }

    /// Disables the Fetch domain.
    #[inline]
    #[must_use]
    pub fn without_fetch(mut self) -> Self {
        self.enable_fetch = false;
        self
    }

    /// Disables cookie injection.
    #[inline]
    #[must_use]
    pub fn without_cookie_injection(mut self) -> Self {
        self.inject_cookies = false;
        self
    }

    /// Returns `true` if `url` points at one of the target hosts.
    #[must_use]
    pub fn is_target_url(&self, url: &str) -> bool {
        self.target_hosts.iter().any(|host| url.contains(host.as_str()))
    }
}

// ============================================================================
// SupervisorOptions
// ============================================================================

/// Options for the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Wait after a disconnect before reconnecting.
    pub reconnect_delay: Duration,
    /// Period of the `is_connected` poll.
    pub poll_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorOptions {
    /// Creates options with production defaults.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Sets the reconnect delay.
    #[inline]
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the poll interval.
    #[inline]
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Acquisition strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Speak the protocol over a raw WebSocket.
    #[default]
    Direct,
    /// Observe the protocol inside a CDP-controlled browser.
    Browser,
}

/// Everything needed to build and supervise a transport.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Selected strategy.
    pub mode: TransportMode,
    /// Account credentials.
    pub credentials: Credentials,
    /// Direct-mode options.
    pub direct: DirectOptions,
    /// Browser-mode options.
    pub browser: BrowserOptions,
    /// Reconnect loop options.
    pub supervisor: SupervisorOptions,
}

impl Settings {
    /// Creates direct-mode settings with defaults.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            mode: TransportMode::Direct,
            credentials,
            direct: DirectOptions::new(),
            browser: BrowserOptions::default(),
            supervisor: SupervisorOptions::new(),
        }
    }

    /// Loads settings from the process environment.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `COOKIES_STR` is missing or any value is malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Loads settings through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`Settings::from_env`].
    pub fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let cookies = lookup("COOKIES_STR")
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::config("COOKIES_STR is not set"))?;

        let settings = Self {
            mode: if flag(lookup, "USE_BROWSER_MODE") {
                TransportMode::Browser
            } else {
                TransportMode::Direct
            },
            credentials: Credentials::from_cookie_str(&cookies)?,
            direct: DirectOptions::from_lookup(lookup)?,
            browser: BrowserOptions::from_lookup(lookup)?,
            supervisor: SupervisorOptions::new(),
        };
        settings.direct.validate()?;
        Ok(settings)
    }

    /// Sets the mode.
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    Ok(parse_opt::<u64>(lookup, key)?.map_or(default, Duration::from_secs))
}

fn parse_opt<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{key} must be a number, got {raw:?}"))),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key).is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
}

// ============================================================================
// Tests
// ============================================================================
