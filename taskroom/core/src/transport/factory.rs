//! Transport Factory
//!
//! Picks a transport implementation for the configured target.

use super::{config::TransportConfig, traits::EventTransport, TransportError};

#[cfg(feature = "websocket")]
use super::websocket::WebSocketTransport;

const NETWORK_SCHEMES: [&str; 4] = ["http://", "https://", "ws://", "wss://"];

/// Create a transport for the configured target
///
/// Network addresses get the WebSocket transport. There is no configuration
/// that yields an in-process transport; build one with
/// [`super::InProcessTransport::new_pair`] directly.
///
/// # Errors
///
/// Returns `TransportError::InvalidState` if:
/// - no target can be resolved (production mode without an origin)
/// - the target is not a network address
/// - the crate was built without the `websocket` feature
pub fn create_transport(
    config: &TransportConfig,
) -> Result<Box<dyn EventTransport>, TransportError> {
    let url = config.resolve_url().ok_or_else(|| {
        TransportError::InvalidState("no connection target configured".to_string())
    })?;

    if !NETWORK_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(TransportError::InvalidState(format!(
            "unsupported connection target '{url}'"
        )));
    }

    #[cfg(feature = "websocket")]
    let transport: Result<Box<dyn EventTransport>, TransportError> =
        Ok(Box::new(WebSocketTransport::new()));

    #[cfg(not(feature = "websocket"))]
    let transport = Err(TransportError::InvalidState(
        "built without the websocket transport".to_string(),
    ));

    transport
}
