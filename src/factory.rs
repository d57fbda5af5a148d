//! Transport construction from [`Settings`].

use std::sync::Arc;

use tracing::info;

use crate::config::{Settings, TransportMode};
use crate::protocol::{Decrypt, MessageCodec};
use crate::transport::{
    BrowserMediatedTransport, ConnectionTransport, DirectTransport, TokenSource,
};

/// Builds the transport selected by `settings.mode`.
///
/// `token_source` is only used in direct mode; browser mode relies on the
/// page's own session.
#[must_use]
pub fn create_transport(
    settings: &Settings,
    token_source: Arc<dyn TokenSource>,
    decryptor: Arc<dyn Decrypt>,
) -> Arc<dyn ConnectionTransport> {
    let codec = MessageCodec::new(decryptor);
    info!(mode = ?settings.mode, user_id = settings.credentials.user_id(), "Creating transport");

    match settings.mode {
        TransportMode::Direct => Arc::new(DirectTransport::new(
            settings.direct.clone(),
            settings.credentials.clone(),
            token_source,
            codec,
        )),
        TransportMode::Browser => Arc::new(BrowserMediatedTransport::new(
            settings.browser.clone(),
            settings.credentials.clone(),
            codec,
        )),
    }
}
