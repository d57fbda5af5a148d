//! Error types for the Goofish transport.
//!
//! Errors are used *inside* the crate and by the pluggable seams
//! ([`TokenSource`](crate::transport::TokenSource),
//! [`BrowserConnector`](crate::cdp::BrowserConnector), ...). They never cross a
//! [`ConnectionTransport`](crate::transport::ConnectionTransport) method:
//! transports log them and convert them into `bool` results or state
//! transitions.
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::ConnectFailure`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::ProtocolDecode`] |
//! | Maintenance | [`Error::TokenRefresh`], [`Error::HeartbeatTimeout`] |
//! | Browser | [`Error::BrowserDetectionTimeout`], [`Error::Cdp`], [`Error::ScriptError`], [`Error::ProcessLaunchFailed`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when options or credentials are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection could not be established.
    ///
    /// Socket refused, handshake rejected, or registration could not be sent.
    #[error("Connect failed: {message}")]
    ConnectFailure {
        /// Description of the failure.
        message: String,
    },

    /// Connection attempt exceeded its time budget.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The socket or session is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed or unrecognized envelope.
    ///
    /// Always non-fatal: the frame is dropped.
    #[error("Protocol decode error: {message}")]
    ProtocolDecode {
        /// Description of the decode failure.
        message: String,
    },

    // ========================================================================
    // Maintenance Errors
    // ========================================================================
    /// Access token could not be fetched.
    ///
    /// Retried on a fixed interval; never tears down a live connection.
    #[error("Token refresh failed: {message}")]
    TokenRefresh {
        /// Description of the failure.
        message: String,
    },

    /// No heartbeat acknowledgement within `interval + timeout`.
    #[error("Heartbeat timeout: no ack for {silent_ms}ms")]
    HeartbeatTimeout {
        /// Milliseconds since the last acknowledgement.
        silent_ms: u64,
    },

    // ========================================================================
    // Browser Errors
    // ========================================================================
    /// No page reported a live target socket within the wait window.
    #[error("No primary WebSocket detected within {timeout_ms}ms")]
    BrowserDetectionTimeout {
        /// Milliseconds waited before giving up.
        timeout_ms: u64,
    },

    /// CDP command failed.
    #[error("CDP error {code}: {message}")]
    Cdp {
        /// Protocol error code (`-1` for client-side failures).
        code: i64,
        /// Error message.
        message: String,
    },

    /// Script evaluation raised in the page.
    #[error("Script error: {message}")]
    ScriptError {
        /// Exception text from the page.
        message: String,
    },

    /// Failed to launch the browser process.
    #[error("Failed to launch browser: {message}")]
    ProcessLaunchFailed {
        /// Description of the launch failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<WsError>),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connect failure.
    #[inline]
    pub fn connect_failure(message: impl Into<String>) -> Self {
        Self::ConnectFailure {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a protocol decode error.
    #[inline]
    pub fn protocol_decode(message: impl Into<String>) -> Self {
        Self::ProtocolDecode {
            message: message.into(),
        }
    }

    /// Creates a token refresh error.
    #[inline]
    pub fn token_refresh(message: impl Into<String>) -> Self {
        Self::TokenRefresh {
            message: message.into(),
        }
    }

    /// Creates a heartbeat timeout error.
    #[inline]
    pub fn heartbeat_timeout(silent_ms: u64) -> Self {
        Self::HeartbeatTimeout { silent_ms }
    }

    /// Creates a browser detection timeout error.
    #[inline]
    pub fn browser_detection_timeout(timeout_ms: u64) -> Self {
        Self::BrowserDetectionTimeout { timeout_ms }
    }

    /// Creates a CDP protocol error.
    #[inline]
    pub fn cdp(code: i64, message: impl Into<String>) -> Self {
        Self::Cdp {
            code,
            message: message.into(),
        }
    }

    /// Creates a script error.
    #[inline]
    pub fn script_error(message: impl Into<String>) -> Self {
        Self::ScriptError {
            message: message.into(),
        }
    }

    /// Creates a process launch failed error.
    #[inline]
    pub fn process_launch_failed(message: impl Into<String>) -> Self {
        Self::ProcessLaunchFailed {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::HeartbeatTimeout { .. }
                | Self::BrowserDetectionTimeout { .. }
        )
    }

    /// Returns `true` if this error surfaces to the supervisor as a failed connect.
    #[inline]
    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailure { .. }
                | Self::ConnectionTimeout { .. }
                | Self::BrowserDetectionTimeout { .. }
                | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
