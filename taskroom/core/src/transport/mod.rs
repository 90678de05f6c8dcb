//! Transport Layer
//!
//! The physical side of the shared connection:
//! - `InProcess`: channel pair for embedding and tests
//! - `WebSocket`: Socket.IO v4 client for a real server (feature `websocket`)
//!
//! Transports only move named JSON events. Subscription bookkeeping lives in
//! the [`Dispatcher`], which is owned by the connection and outlives any
//! single link.

pub mod config;
pub mod dispatch;
pub mod factory;
pub mod in_process;
pub mod packet;
pub mod traits;
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-exports for convenience
pub use config::{EnvironmentMode, TransportConfig, DEV_URL};
pub use dispatch::{Callback, CallbackId, Dispatcher};
pub use factory::create_transport;
pub use in_process::{AcceptMode, InProcessServer, InProcessTransport};
pub use traits::{DisconnectReason, EventTransport, Inbound, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
