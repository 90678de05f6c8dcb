//! Packet Codec
//!
//! Text wire format for the event stream: Socket.IO v4 packets carried inside
//! Engine.IO v4 message packets over a WebSocket.
//!
//! # Packet Format
//!
//! ```text
//! +--------+--------+---------------+---------+----------------------------+
//! | EIO(1) | SIO(1) | /namespace,   | ack id  | JSON body                  |
//! | '4'    | '2'    | (optional)    | (opt.)  | ["agent:thought", {...}]   |
//! +--------+--------+---------------+---------+----------------------------+
//! ```
//!
//! Engine.IO types: `0` open, `1` close, `2` ping, `3` pong, `4` message,
//! `5` upgrade, `6` noop. Socket.IO types inside a message: `0` connect,
//! `1` disconnect, `2` event, `3` ack, `4` connect error. Binary Socket.IO
//! packets (`5`, `6`) are not supported and decode to a protocol error.
//!
//! Namespace prefixes and ack ids are parsed and discarded; the client only
//! ever talks to the default namespace and never requests acks.

use serde::Deserialize;
use serde_json::Value;

use super::TransportError;

/// Path and query appended to the base URL for the WebSocket transport
pub const SOCKET_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

/// Default ping interval when the server omits one (ms)
const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;

/// Default ping timeout when the server omits one (ms)
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

/// Engine.IO open handshake body
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Engine.IO session id
    pub sid: String,
    /// Interval at which the server pings (ms)
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// How long the server waits for a pong (ms)
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    /// Largest payload the server accepts
    #[serde(default)]
    pub max_payload: Option<u64>,
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_ping_timeout() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}

/// Socket.IO packet carried by an Engine.IO message
#[derive(Clone, Debug, PartialEq)]
pub enum SocketPacket {
    /// Namespace connect (request from the client, acceptance from the server)
    Connect(Option<Value>),
    /// Namespace disconnect
    Disconnect,
    /// Named event
    Event {
        /// Event name
        name: String,
        /// First argument after the name (`Value::Null` when absent)
        payload: Value,
    },
    /// Ack for an event the client emitted with an id
    Ack,
    /// Server refused the namespace connect
    ConnectError(Value),
}

/// Engine.IO packet
#[derive(Clone, Debug, PartialEq)]
pub enum EnginePacket {
    /// Session opened
    Open(OpenHandshake),
    /// Session closed
    Close,
    /// Heartbeat probe from the server
    Ping(Option<String>),
    /// Heartbeat reply
    Pong(Option<String>),
    /// Socket.IO payload
    Message(SocketPacket),
    /// Transport upgrade (unused on a pure WebSocket session)
    Upgrade,
    /// No-op
    Noop,
}

fn protocol(msg: impl Into<String>) -> TransportError {
    TransportError::Protocol(msg.into())
}

fn optional_data(rest: &str) -> Option<String> {
    (!rest.is_empty()).then(|| rest.to_string())
}

/// Decode one text frame
///
/// # Errors
///
/// Returns `TransportError::Protocol` for empty frames, unknown packet types
/// and binary packets, and `TransportError::Serialization` for malformed
/// JSON bodies.
pub fn decode(frame: &str) -> Result<EnginePacket, TransportError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or_else(|| protocol("empty frame"))?;
    let rest = chars.as_str();

    match kind {
        '0' => Ok(EnginePacket::Open(serde_json::from_str(rest)?)),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(optional_data(rest))),
        '3' => Ok(EnginePacket::Pong(optional_data(rest))),
        '4' => decode_socket(rest).map(EnginePacket::Message),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(protocol(format!("unknown engine packet type '{other}'"))),
    }
}

fn decode_socket(body: &str) -> Result<SocketPacket, TransportError> {
    let mut chars = body.chars();
    let kind = chars
        .next()
        .ok_or_else(|| protocol("empty socket packet"))?;
    let json = strip_ack_id(strip_namespace(chars.as_str()));

    match kind {
        '0' => {
            let data = if json.is_empty() {
                None
            } else {
                Some(serde_json::from_str(json)?)
            };
            Ok(SocketPacket::Connect(data))
        }
        '1' => Ok(SocketPacket::Disconnect),
        '2' => decode_event(json),
        '3' => Ok(SocketPacket::Ack),
        '4' => {
            let data = if json.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(json)?
            };
            Ok(SocketPacket::ConnectError(data))
        }
        '5' | '6' => Err(protocol("binary packets are not supported")),
        other => Err(protocol(format!("unknown socket packet type '{other}'"))),
    }
}

fn strip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    } else {
        rest
    }
}

fn strip_ack_id(rest: &str) -> &str {
    rest.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn decode_event(json: &str) -> Result<SocketPacket, TransportError> {
    let args: Vec<Value> = serde_json::from_str(json)?;
    let mut args = args.into_iter();
    let name = match args.next() {
        Some(Value::String(name)) => name,
        _ => return Err(protocol("event packet without a name")),
    };
    let payload = args.next().unwrap_or(Value::Null);
    Ok(SocketPacket::Event { name, payload })
}

/// Encode a packet as a text frame
///
/// # Errors
///
/// Returns `TransportError::Protocol` for packets the client never sends
/// (open handshakes) and `TransportError::Serialization` if a payload
/// cannot be serialized.
pub fn encode(packet: &EnginePacket) -> Result<String, TransportError> {
    let frame = match packet {
        EnginePacket::Open(_) => return Err(protocol("clients do not send open packets")),
        EnginePacket::Close => "1".to_string(),
        EnginePacket::Ping(data) => format!("2{}", data.as_deref().unwrap_or_default()),
        EnginePacket::Pong(data) => format!("3{}", data.as_deref().unwrap_or_default()),
        EnginePacket::Upgrade => "5".to_string(),
        EnginePacket::Noop => "6".to_string(),
        EnginePacket::Message(socket) => match socket {
            SocketPacket::Connect(None) => "40".to_string(),
            SocketPacket::Connect(Some(auth)) => format!("40{}", serde_json::to_string(auth)?),
            SocketPacket::Disconnect => "41".to_string(),
            SocketPacket::Event { name, payload } => encode_event(name, payload)?,
            SocketPacket::Ack => "43[]".to_string(),
            SocketPacket::ConnectError(data) => format!("44{}", serde_json::to_string(data)?),
        },
    };
    Ok(frame)
}

/// Encode a named event as a text frame
///
/// A `Value::Null` payload is sent as a name-only event.
///
/// # Errors
///
/// Returns `TransportError::Serialization` if the payload cannot be serialized.
pub fn encode_event(name: &str, payload: &Value) -> Result<String, TransportError> {
    let body = if payload.is_null() {
        serde_json::to_string(&[name])?
    } else {
        serde_json::to_string(&(name, payload))?
    };
    Ok(format!("42{body}"))
}

/// Build the WebSocket endpoint for a base server address
///
/// `http` becomes `ws` and `https` becomes `wss`; a base that is already a
/// WebSocket address keeps its scheme. A trailing slash is dropped.
#[must_use]
pub fn socket_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };

    if base.contains("/socket.io/") {
        base
    } else {
        format!("{base}{SOCKET_PATH}")
    }
}
