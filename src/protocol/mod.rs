//! Wire protocol of the marketplace IM socket.
//!
//! # Protocol Overview
//!
//! Every frame is a JSON text frame. The client registers with `/reg`, then
//! the server pushes envelopes which the client must ACK by echoing their
//! `mid`.
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `/reg` | Client → Server | Registration with access token |
//! | `/r/SyncStatus/ackDiff` | Client → Server | Initial sync acknowledgement |
//! | `/!` | Client → Server | Heartbeat |
//! | `code: 200` | Both | ACK / heartbeat ack / history batch |
//! | push envelope | Server → Client | Chat, typing, system, order, sync push |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `codec` | Envelope classification and outbound encoding |
//! | `frames` | Control frame builders and inspectors |
//! | `history` | History batch parsing |
//! | `message` | Typed [`Message`] |

// ============================================================================
// Submodules
// ============================================================================

/// Envelope classification and outbound encoding.
pub mod codec;

/// Control frame builders and inspectors.
pub mod frames;

/// History batch parsing.
pub mod history;

/// Typed messages.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::{Decrypt, DecryptError, MessageCodec, PlainPayload};
pub use frames::Registration;
pub use history::HistoryBatchParser;
pub use message::{Message, MessageKind};
