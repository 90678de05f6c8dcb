//! WebSocket Transport
//!
//! Client-side Socket.IO session over `tokio-tungstenite`.
//!
//! # Handshake
//!
//! ```text
//! client                               server
//!   | -- GET /socket.io/?EIO=4&... -->    |
//!   | <-- 0{"sid",pingInterval,...} --    |   engine open
//!   | -- 40 ------------------------->    |   namespace connect
//!   | <-- 40{"sid"} / 44{"message"} --    |   accepted / refused
//!   | <-- 2 ----- 3 ----------------->    |   heartbeat (server pings)
//! ```
//!
//! After the handshake the stream is split: a writer task drains an outbound
//! channel into the sink, a reader task decodes frames, answers pings and
//! forwards events. The reader gives up when no frame arrives within
//! `pingInterval + pingTimeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::packet::{self, EnginePacket, SocketPacket};
use super::traits::{DisconnectReason, EventTransport, Inbound, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Capacity of the inbound and outbound frame channels
const CHANNEL_CAPACITY: usize = 256;

/// Socket.IO client over a WebSocket
pub struct WebSocketTransport {
    /// Outbound text frames, drained by the writer task
    writer: Option<mpsc::Sender<String>>,
    /// Reader task handle
    reader: Option<JoinHandle<()>>,
    /// Whether the link is up
    connected: Arc<AtomicBool>,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    /// Create a disconnected transport
    #[must_use]
    pub fn new() -> Self {
        Self {
            writer: None,
            reader: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn text(packet: &EnginePacket) -> Result<Message, TransportError> {
    Ok(Message::Text(packet::encode(packet)?))
}

fn refusal_message(data: &Value) -> String {
    data.get("message")
        .and_then(Value::as_str)
        .map_or_else(|| data.to_string(), str::to_string)
}

async fn next_packet(source: &mut WsSource) -> Result<EnginePacket, TransportError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(frame))) => return packet::decode(&frame),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
        }
    }
}

/// Run the Engine.IO open and Socket.IO connect exchange
///
/// Returns the heartbeat deadline advertised by the server.
async fn handshake(sink: &mut WsSink, source: &mut WsSource) -> Result<Duration, TransportError> {
    let open = match next_packet(source).await? {
        EnginePacket::Open(open) => open,
        other => {
            return Err(TransportError::Protocol(format!(
                "expected open packet, got {other:?}"
            )))
        }
    };
    tracing::debug!(sid = %open.sid, ping_interval = open.ping_interval, "Engine session opened");

    sink.send(text(&EnginePacket::Message(SocketPacket::Connect(None)))?)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    loop {
        match next_packet(source).await? {
            EnginePacket::Message(SocketPacket::Connect(_)) => break,
            EnginePacket::Message(SocketPacket::ConnectError(data)) => {
                return Err(TransportError::ConnectRejected(refusal_message(&data)));
            }
            EnginePacket::Ping(data) => {
                sink.send(text(&EnginePacket::Pong(data))?)
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            }
            EnginePacket::Close => return Err(TransportError::ConnectionClosed),
            other => tracing::debug!(packet = ?other, "Ignoring packet during handshake"),
        }
    }

    Ok(Duration::from_millis(open.ping_interval + open.ping_timeout))
}

async fn write_loop(mut sink: WsSink, mut frames: mpsc::Receiver<String>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = sink.send(Message::Text(frame)).await {
            tracing::warn!(error = %e, "Write error");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut source: WsSource,
    inbound: mpsc::Sender<Inbound>,
    writer: mpsc::Sender<String>,
    heartbeat: Duration,
    connected: Arc<AtomicBool>,
) {
    let reason = loop {
        let next = match tokio::time::timeout(heartbeat, source.next()).await {
            Ok(next) => next,
            Err(_) => break DisconnectReason::TransportError("ping timeout".to_string()),
        };

        let frame = match next {
            Some(Ok(Message::Text(frame))) => frame,
            Some(Ok(Message::Close(_))) | None => break DisconnectReason::TransportClose,
            Some(Ok(_)) => continue,
            Some(Err(e)) => break DisconnectReason::TransportError(e.to_string()),
        };

        match packet::decode(&frame) {
            Ok(EnginePacket::Ping(data)) => {
                if let Ok(pong) = packet::encode(&EnginePacket::Pong(data)) {
                    let _ = writer.send(pong).await;
                }
            }
            Ok(EnginePacket::Message(SocketPacket::Event { name, payload })) => {
                tracing::trace!(event = %name, "Inbound event");
                if inbound.send(Inbound::Event { name, payload }).await.is_err() {
                    tracing::debug!("Inbound receiver dropped");
                    connected.store(false, Ordering::SeqCst);
                    return;
                }
            }
            Ok(EnginePacket::Message(SocketPacket::Disconnect)) => {
                break DisconnectReason::ServerInitiated
            }
            Ok(EnginePacket::Close) => break DisconnectReason::TransportClose,
            Ok(other) => tracing::debug!(packet = ?other, "Ignoring packet"),
            Err(e) => tracing::warn!(error = %e, "Frame decode error"),
        }
    };

    connected.store(false, Ordering::SeqCst);
    tracing::info!(reason = %reason, "Socket closed");
    let _ = inbound.send(Inbound::Closed(reason)).await;
}

#[async_trait]
impl EventTransport for WebSocketTransport {
    async fn connect(&mut self, url: &str) -> Result<mpsc::Receiver<Inbound>, TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState("Already connected".to_string()));
        }

        let endpoint = packet::socket_url(url);
        let (stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{endpoint}: {e}")))?;

        let (mut sink, mut source) = stream.split();
        let heartbeat = handshake(&mut sink, &mut source).await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (writer_tx, writer_rx) = mpsc::channel(CHANNEL_CAPACITY);

        self.connected.store(true, Ordering::SeqCst);
        tokio::spawn(write_loop(sink, writer_rx));
        self.reader = Some(tokio::spawn(read_loop(
            source,
            inbound_tx,
            writer_tx.clone(),
            heartbeat,
            Arc::clone(&self.connected),
        )));
        self.writer = Some(writer_tx);

        tracing::info!(url = %endpoint, "Socket connected");
        Ok(inbound_rx)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            if let Ok(goodbye) = packet::encode(&EnginePacket::Message(SocketPacket::Disconnect)) {
                let _ = writer.send(goodbye).await;
            }
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::info!("Socket disconnected");
        }
        Ok(())
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("Not connected".to_string()))?;

        let frame = packet::encode_event(event, &payload)?;
        writer
            .send(frame)
            .await
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
