//! In-Process Transport
//!
//! Channel-based transport pair for embedded mode and tests. The client half
//! implements [`EventTransport`]; the server half plays the remote end: it
//! pushes events to the client, observes what the client emitted and can
//! drop or refuse the link.
//!
//! # Usage
//!
//! ```ignore
//! let (transport, server) = InProcessTransport::new_pair();
//! let client = Client::new(config, Box::new(transport));
//!
//! // Answer join requests
//! let (name, payload) = server.next_emit().await.unwrap();
//! server.emit("joined", payload);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::traits::{DisconnectReason, EventTransport, Inbound, TransportError};

/// Capacity of the server → client channel
const INBOUND_CAPACITY: usize = 1024;

/// How the fake server answers connection attempts
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum AcceptMode {
    /// Complete the handshake
    #[default]
    Accept,
    /// Answer with a connect error carrying this message
    Refuse(String),
    /// Never answer (the caller's timeout decides)
    Stall,
}

struct Shared {
    inbound: Mutex<Option<mpsc::Sender<Inbound>>>,
    accept: Mutex<AcceptMode>,
    last_url: Mutex<Option<String>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Shared {
    fn drop_link(&self) -> Option<mpsc::Sender<Inbound>> {
        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().take()
    }
}

/// Client half of an in-process link
pub struct InProcessTransport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<(String, Value)>,
}

/// Server half of an in-process link
#[derive(Clone)]
pub struct InProcessServer {
    shared: Arc<Shared>,
    outbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, Value)>>>,
}

impl InProcessTransport {
    /// Create a connected pair of client transport and fake server
    #[must_use]
    pub fn new_pair() -> (Self, InProcessServer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbound: Mutex::new(None),
            accept: Mutex::new(AcceptMode::Accept),
            last_url: Mutex::new(None),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });

        let transport = Self {
            shared: Arc::clone(&shared),
            outbound: out_tx,
        };
        let server = InProcessServer {
            shared,
            outbound: Arc::new(tokio::sync::Mutex::new(out_rx)),
        };
        (transport, server)
    }
}

#[async_trait]
impl EventTransport for InProcessTransport {
    async fn connect(&mut self, url: &str) -> Result<mpsc::Receiver<Inbound>, TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_url.lock() = Some(url.to_string());

        let mode = self.shared.accept.lock().clone();
        match mode {
            AcceptMode::Accept => {}
            AcceptMode::Refuse(message) => return Err(TransportError::ConnectRejected(message)),
            AcceptMode::Stall => std::future::pending::<()>().await,
        }

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        *self.shared.inbound.lock() = Some(tx);
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            self.shared.drop_link();
            self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send((event.to_string(), payload))
            .map_err(|_| TransportError::SendFailed("server half dropped".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl InProcessServer {
    /// Push an event to the client. Returns `false` if no link is open.
    pub fn emit(&self, event: &str, payload: Value) -> bool {
        let inbound = self.shared.inbound.lock();
        match inbound.as_ref() {
            Some(tx) => tx
                .try_send(Inbound::Event {
                    name: event.to_string(),
                    payload,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Drop the link from the server side with the given reason
    pub fn close(&self, reason: DisconnectReason) {
        if let Some(tx) = self.shared.drop_link() {
            let _ = tx.try_send(Inbound::Closed(reason));
        }
    }

    /// Next event the client emitted, waiting for one to arrive
    pub async fn next_emit(&self) -> Option<(String, Value)> {
        self.outbound.lock().await.recv().await
    }

    /// Next event the client emitted, if one is already queued
    pub fn try_next_emit(&self) -> Option<(String, Value)> {
        self.outbound.try_lock().ok()?.try_recv().ok()
    }

    /// Wait for the client to emit `event`, skipping anything else
    pub async fn expect_emit(&self, event: &str) -> Option<Value> {
        loop {
            let (name, payload) = self.next_emit().await?;
            if name == event {
                return Some(payload);
            }
        }
    }

    /// Change how future connection attempts are answered
    pub fn set_accept(&self, mode: AcceptMode) {
        *self.shared.accept.lock() = mode;
    }

    /// Connection attempts seen so far (including refused ones)
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Client-initiated disconnects seen so far
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    /// Whether the client currently holds an open link
    #[must_use]
    pub fn is_client_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// URL of the most recent connection attempt
    #[must_use]
    pub fn last_url(&self) -> Option<String> {
        self.shared.last_url.lock().clone()
    }
}
