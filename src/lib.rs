//! Goofish transport - Marketplace chat connection library.
//!
//! This library keeps a seller account connected to the Goofish (Xianyu)
//! instant-messaging gateway and turns its push envelopes into typed
//! [`Message`]s.
//!
//! # Architecture
//!
//! Two interchangeable strategies implement [`ConnectionTransport`]:
//!
//! - **Direct**: speaks the IM protocol over its own WebSocket, with
//!   registration, per-frame ACKs, heartbeats and hourly token refresh
//! - **Browser-mediated**: drives a real browser over CDP and rides the
//!   socket the marketplace page opens itself
//!
//! Key design principles:
//!
//! - Each transport owns its tasks; `disconnect` cancels all of them
//! - One writer task per socket; everything else enqueues frames
//! - User callbacks run on a dispatch task, never on the read loop
//! - Errors stay inside the crate: transports report `bool` and state
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use goofish_transport::{
//!     PlainPayload, ReconnectSupervisor, Result, Settings, StaticTokenSource, create_transport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = Settings::from_env()?;
//!     let transport = create_transport(
//!         &settings,
//!         Arc::new(StaticTokenSource::new("access-token")),
//!         Arc::new(PlainPayload),
//!     );
//!
//!     let supervisor = ReconnectSupervisor::new(settings.supervisor);
//!     supervisor
//!         .run(
//!             transport.as_ref(),
//!             Arc::new(|message| println!("{}: {}", message.kind(), message.content())),
//!         )
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cdp`] | Chrome DevTools Protocol client and launcher |
//! | [`config`] | Option structs and environment loading |
//! | [`credentials`] | Cookie-derived account identity |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`factory`] | Transport selection |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Envelope codec and history parsing |
//! | [`supervisor`] | Reconnect loop |
//! | [`transport`] | Direct and browser-mediated transports |

// ============================================================================
// Modules
// ============================================================================

/// Chrome DevTools Protocol client.
///
/// Capability traits plus a concrete client over one browser WebSocket.
pub mod cdp;

/// Configuration.
pub mod config;

/// Cookie-derived account identity.
pub mod credentials;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Transport selection from settings.
pub mod factory;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing message ids, device ids and targets.
pub mod identifiers;

/// Marketplace IM wire protocol.
pub mod protocol;

/// Reconnect loop.
pub mod supervisor;

/// Connection transports.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{
    BrowserEndpoint, BrowserOptions, DirectOptions, LaunchOptions, Settings, SupervisorOptions,
    TransportMode,
};
pub use credentials::Credentials;

// Error types
pub use error::{Error, Result};

// Construction and supervision
pub use factory::create_transport;
pub use supervisor::{ReconnectSupervisor, StopHandle};

// Identifier types
pub use identifiers::{DeviceId, MessageId, SendUuid, TargetId};

// Protocol types
pub use protocol::{
    Decrypt, DecryptError, HistoryBatchParser, Message, MessageCodec, MessageKind, PlainPayload,
};

// Transport types
pub use transport::{
    BrowserMediatedTransport, ConnectionState, ConnectionTransport, DirectTransport,
    MessageHandler, StaticTokenSource, TokenSource,
};
