//! Transport Traits
//!
//! Core trait definitions for the event-stream connection.
//!
//! A transport is a dumb pipe for named JSON events. It knows how to open a
//! session with the server, push outbound events and hand inbound frames to
//! whoever owns the link. Everything above it (listener dedup, rooms,
//! reconnection) lives in the connection layer.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Why an established link went away
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local side called `disconnect()`
    ClientInitiated,
    /// The server closed the session on purpose
    ServerInitiated,
    /// The underlying socket closed without a protocol-level goodbye
    TransportClose,
    /// The underlying socket failed
    TransportError(String),
}

impl DisconnectReason {
    /// Whether this loss is a transport blip (eligible for automatic reconnection)
    #[must_use]
    pub fn is_transport_loss(&self) -> bool {
        matches!(self, Self::TransportClose | Self::TransportError(_))
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientInitiated => write!(f, "client disconnect"),
            Self::ServerInitiated => write!(f, "server disconnect"),
            Self::TransportClose => write!(f, "transport close"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// A frame delivered by an established link, in arrival order
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// A named event with its JSON payload
    Event {
        /// Event name (e.g. `agent:thought`)
        name: String,
        /// Event payload (`Value::Null` when the server sent none)
        payload: Value,
    },
    /// The link is gone; no further frames follow
    Closed(DisconnectReason),
}

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not reach the server
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// The server answered the handshake with a refusal
    #[error("Connection rejected by server: {0}")]
    ConnectRejected(String),
    /// The link closed while an operation was in flight
    #[error("Connection closed")]
    ConnectionClosed,
    /// Failed to hand an outbound event to the link
    #[error("Send failed: {0}")]
    SendFailed(String),
    /// The peer sent something the codec does not understand
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Payload serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Transport not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Client side of the event-stream connection
///
/// `connect` hands back the receiving half of the link so that the owner can
/// pump inbound frames without holding a lock on the transport, while
/// `emit` stays callable through a shared reference.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Open a session with the server at `url`
    ///
    /// Resolves once the server has accepted the session. Frames arrive on
    /// the returned receiver until an [`Inbound::Closed`] (or the channel
    /// closing) marks the end of the link.
    async fn connect(&mut self, url: &str) -> Result<mpsc::Receiver<Inbound>, TransportError>;

    /// Close the session. Calling this on a closed transport is a no-op.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Send a named event to the server
    async fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Check if the link is currently established
    fn is_connected(&self) -> bool;
}
