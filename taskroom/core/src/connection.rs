//! Connection Manager
//!
//! Owns the single shared connection: connect/disconnect lifecycle, the pump
//! that feeds inbound events to the listener registry, transport-level
//! reconnection and reference-counted teardown.
//!
//! # Lifecycle
//!
//! ```text
//!              connect()                        link lost (transport)
//!  ┌──────────┐ ───────► ┌───────────┐ ─────────────────────► ┌──────────────┐
//!  │ detached │          │ connected │ ◄───────────────────── │ reconnecting │
//!  └──────────┘ ◄─────── └───────────┘   attempt succeeded    └──────────────┘
//!      ▲       disconnect() /   │                                    │
//!      │       grace expired    │ server disconnect                  │ attempts
//!      └────────────────────────┴────────────────────────────────────┘ exhausted
//! ```
//!
//! Consumers hold a [`ConnectionLease`] (or call `acquire`/`release`). When
//! the last lease goes away the connection stays up for a grace window so a
//! consumer that remounts right away finds it still open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::listeners::ListenerRegistry;
use crate::transport::{
    DisconnectReason, Dispatcher, EventTransport, Inbound, TransportConfig, TransportError,
};

/// Capacity of the lifecycle broadcast channel
const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications published by the connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A link was established by `connect`
    Connected,
    /// The link went away
    Disconnected(DisconnectReason),
    /// A transport-level reconnection attempt is about to run
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// A transport-level reconnection attempt succeeded
    Reconnected {
        /// Attempt that succeeded
        attempt: u32,
    },
    /// Transport-level reconnection gave up
    ReconnectFailed {
        /// Attempts made
        attempts: u32,
    },
}

/// Errors from connection operations
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The operation needs an established link
    #[error("Not connected")]
    NotConnected,
    /// No address to connect to
    #[error("No connection target: {0}")]
    NoTarget(String),
    /// The link was not established in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    /// The client closed the connection; only an explicit connect reopens it
    #[error("Connection closed by the client")]
    Closed,
    /// The transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Default)]
struct LeaseState {
    ref_count: usize,
    teardown: Option<JoinHandle<()>>,
}

struct Inner {
    config: TransportConfig,
    transport: tokio::sync::Mutex<Box<dyn EventTransport>>,
    listeners: ListenerRegistry,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ConnectionEvent>,
    lease: Mutex<LeaseState>,
    pump: Mutex<Option<JoinHandle<()>>>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    last_url: Mutex<Option<String>>,
    /// Set by `disconnect`, cleared by an explicit connect
    closed: AtomicBool,
    /// Serializes link establishment and teardown
    gate: tokio::sync::Mutex<()>,
}

/// Handle to the shared connection
///
/// Cheap to clone; every clone refers to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a detached manager over `transport`
    #[must_use]
    pub fn new(config: TransportConfig, transport: Box<dyn EventTransport>) -> Self {
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                transport: tokio::sync::Mutex::new(transport),
                listeners: ListenerRegistry::new(Dispatcher::new()),
                connected,
                events,
                lease: Mutex::new(LeaseState::default()),
                pump: Mutex::new(None),
                recovery: Mutex::new(None),
                last_url: Mutex::new(None),
                closed: AtomicBool::new(false),
                gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Transport configuration in use
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Connect to the configured target
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::NoTarget` if no address can be resolved,
    /// plus everything [`Self::connect_to`] returns.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let url = self.inner.config.resolve_url().ok_or_else(|| {
            ConnectionError::NoTarget("production mode requires an origin".to_string())
        })?;
        self.connect_to(&url).await
    }

    /// Connect to `url`
    ///
    /// Resolves immediately when already connected. Concurrent callers are
    /// serialized and the later ones observe the first caller's link.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Timeout` when the handshake does not finish
    /// within the connect timeout, and `ConnectionError::Transport` as soon
    /// as the transport reports a failure (including a refused handshake).
    pub async fn connect_to(&self, url: &str) -> Result<(), ConnectionError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.establish(url, false).await
    }

    /// Connect to the address of the last link, or the configured target
    ///
    /// Unlike [`Self::connect`], this never reopens a connection the client
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` after [`Self::disconnect`], plus
    /// everything [`Self::connect`] returns.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let last = self.inner.last_url.lock().clone();
        let url = match last {
            Some(url) => url,
            None => self.inner.config.resolve_url().ok_or_else(|| {
                ConnectionError::NoTarget("production mode requires an origin".to_string())
            })?,
        };
        self.establish(&url, true).await
    }

    async fn establish(&self, url: &str, resume: bool) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }

        let _gate = self.inner.gate.lock().await;
        if resume && self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }

        self.open_link(url).await?;
        self.publish(ConnectionEvent::Connected);
        Ok(())
    }

    /// Establish a link. The caller holds the gate.
    async fn open_link(&self, url: &str) -> Result<(), ConnectionError> {
        let timeout = self.inner.config.connect_timeout();
        let mut transport = self.inner.transport.lock().await;

        let inbound = match tokio::time::timeout(timeout, transport.connect(url)).await {
            Ok(Ok(inbound)) => inbound,
            Ok(Err(e)) => {
                tracing::warn!(url, error = %e, "Connection failed");
                return Err(e.into());
            }
            Err(_) => {
                let _ = transport.disconnect().await;
                tracing::warn!(url, ?timeout, "Connection timed out");
                return Err(ConnectionError::Timeout(timeout));
            }
        };
        drop(transport);

        *self.inner.last_url.lock() = Some(url.to_string());
        self.inner.connected.send_replace(true);
        self.start_pump(inbound);
        tracing::info!(url, "Connected");
        Ok(())
    }

    fn start_pump(&self, inbound: mpsc::Receiver<Inbound>) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(pump(weak, inbound));
        if let Some(old) = self.inner.pump.lock().replace(handle) {
            old.abort();
        }
    }

    /// Tear down the link and clear the connected state
    ///
    /// Stops any transport-level reconnection in progress and marks the
    /// connection closed, so [`Self::reconnect`] refuses until the next
    /// explicit connect. No-op on the link when already disconnected.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Transport` if the transport fails to close.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(recovery) = self.inner.recovery.lock().take() {
            recovery.abort();
        }

        let _gate = self.inner.gate.lock().await;
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }

        let was_connected = self.inner.connected.send_replace(false);
        self.inner.transport.lock().await.disconnect().await?;

        if was_connected {
            tracing::info!("Disconnected");
            self.publish(ConnectionEvent::Disconnected(
                DisconnectReason::ClientInitiated,
            ));
        }
        Ok(())
    }

    /// Wait until the connection is established
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Timeout` if the connection is not up within
    /// `timeout`.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut connected = self.inner.connected.subscribe();
        let waited = tokio::time::timeout(timeout, connected.wait_for(|up| *up))
            .await
            .map(|up| up.is_ok());
        match waited {
            Ok(true) => Ok(()),
            Ok(false) => Err(ConnectionError::NotConnected),
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        }
    }

    /// Whether a link is established
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Whether the client closed the connection since the last explicit connect
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Observe the connected flag
    #[must_use]
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Subscribe to lifecycle notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The listener registry bound to this connection
    #[must_use]
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    /// Send a named event
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::NotConnected` without a link, or
    /// `ConnectionError::Transport` if the transport rejects the send.
    pub async fn emit(&self, event: &str, payload: Value) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        tracing::debug!(event, "Emitting");
        self.inner
            .transport
            .lock()
            .await
            .emit(event, payload)
            .await
            .map_err(Into::into)
    }

    /// Serialize `payload` and send it as a named event
    ///
    /// # Errors
    ///
    /// As [`Self::emit`], plus a serialization failure.
    pub async fn emit_json<T: Serialize>(
        &self,
        event: &str,
        payload: &T,
    ) -> Result<(), ConnectionError> {
        let payload = serde_json::to_value(payload).map_err(TransportError::from)?;
        self.emit(event, payload).await
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    /// Register a consumer. Cancels a pending teardown.
    ///
    /// Returns the new reference count.
    pub fn acquire(&self) -> usize {
        let mut lease = self.inner.lease.lock();
        lease.ref_count += 1;
        if let Some(teardown) = lease.teardown.take() {
            teardown.abort();
            tracing::debug!("Pending teardown cancelled");
        }
        lease.ref_count
    }

    /// Unregister a consumer
    ///
    /// When the count drops to zero, teardown is scheduled after the grace
    /// window. Releasing at zero is ignored. Returns the new reference count.
    pub fn release(&self) -> usize {
        let mut lease = self.inner.lease.lock();
        if lease.ref_count == 0 {
            tracing::warn!("Connection released more often than acquired");
            return 0;
        }

        lease.ref_count -= 1;
        if lease.ref_count == 0 {
            lease.teardown = self.schedule_teardown();
        }
        lease.ref_count
    }

    /// Acquire a reference released on drop
    #[must_use]
    pub fn lease(&self) -> ConnectionLease {
        self.acquire();
        ConnectionLease {
            manager: self.clone(),
        }
    }

    /// Current number of consumers
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.lease.lock().ref_count
    }

    fn schedule_teardown(&self) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime to schedule connection teardown");
            return None;
        };

        let weak = Arc::downgrade(&self.inner);
        let grace = self.inner.config.teardown_grace();
        tracing::debug!(?grace, "Teardown scheduled");

        Some(runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut lease = inner.lease.lock();
                if lease.ref_count != 0 {
                    return;
                }
                lease.teardown = None;
            }

            tracing::info!("Idle connection torn down");
            let manager = ConnectionManager { inner };
            if let Err(e) = manager.disconnect().await {
                tracing::warn!(error = %e, "Teardown failed");
            }
        }))
    }

    // ========================================================================
    // Link loss
    // ========================================================================

    fn publish(&self, event: ConnectionEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    async fn handle_loss(&self, reason: DisconnectReason) {
        let was_connected = self.inner.connected.send_replace(false);
        let _ = self.inner.transport.lock().await.disconnect().await;
        if !was_connected {
            return;
        }

        tracing::warn!(reason = %reason, "Connection lost");
        self.publish(ConnectionEvent::Disconnected(reason.clone()));

        let attempts = self.inner.config.reconnect_attempts;
        if !reason.is_transport_loss() || attempts == 0 {
            return;
        }
        let Some(url) = self.inner.last_url.lock().clone() else {
            return;
        };

        let handle = tokio::spawn(self.clone().recover(url, attempts));
        if let Some(old) = self.inner.recovery.lock().replace(handle) {
            old.abort();
        }
    }

    /// Transport-level reconnection loop
    ///
    /// Boxed because it re-enters the pump that spawned it.
    fn recover(self, url: String, attempts: u32) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let delay = self.inner.config.reconnect_delay();

            for attempt in 1..=attempts {
                self.publish(ConnectionEvent::Reconnecting { attempt });
                tokio::time::sleep(delay).await;

                let _gate = self.inner.gate.lock().await;
                if self.is_connected() || self.is_closed() {
                    return;
                }
                match self.open_link(&url).await {
                    Ok(()) => {
                        tracing::info!(attempt, "Reconnected");
                        self.publish(ConnectionEvent::Reconnected { attempt });
                        return;
                    }
                    Err(e) => tracing::warn!(attempt, error = %e, "Reconnection attempt failed"),
                }
            }

            tracing::warn!(attempts, "Reconnection gave up");
            self.publish(ConnectionEvent::ReconnectFailed { attempts });
        })
    }
}

/// Reads one link's inbound frames in order and dispatches them
async fn pump(inner: Weak<Inner>, mut inbound: mpsc::Receiver<Inbound>) {
    let reason = loop {
        match inbound.recv().await {
            Some(Inbound::Event { name, payload }) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let delivered = inner.listeners.dispatcher().dispatch(&name, &payload);
                tracing::trace!(event = %name, delivered, "Dispatched");
            }
            Some(Inbound::Closed(reason)) => break reason,
            None => break DisconnectReason::TransportClose,
        }
    };

    if let Some(inner) = inner.upgrade() {
        ConnectionManager { inner }.handle_loss(reason).await;
    }
}

/// A consumer's reference on the connection, released on drop
pub struct ConnectionLease {
    manager: ConnectionManager,
}

impl ConnectionLease {
    /// The leased connection
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.manager.release();
    }
}
