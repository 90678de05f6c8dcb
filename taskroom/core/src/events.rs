//! Wire Events
//!
//! Event names and payload shapes exchanged with the task server.
//!
//! # Event Flow
//!
//! ```text
//! Client                                   Server
//!   | ── join_task {task_id} ──────────────► |
//!   | ◄─────────────── joined {task_id} ──── |
//!   | ── confirm_room {task_id} ───────────► |
//!   | ◄──────── room_confirmed {task_id} ─── |
//!   | ◄── agent:progress / agent:thought ─── |  (room broadcast)
//!   | ── send_instruction {task_id, ..} ───► |
//!   | ◄── instruction_received / _error ──── |
//!   | ── leave_task {task_id} ─────────────► |
//! ```
//!
//! Agent payloads are parsed leniently: unknown fields are ignored and
//! missing optional fields default, because the server's agents add fields
//! over time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tasks::TaskId;

/// Outbound: request room membership
pub const JOIN_TASK: &str = "join_task";
/// Inbound: join acknowledgment
pub const JOINED: &str = "joined";
/// Outbound: confirm room membership
pub const CONFIRM_ROOM: &str = "confirm_room";
/// Inbound: confirmation acknowledgment
pub const ROOM_CONFIRMED: &str = "room_confirmed";
/// Outbound: leave a room
pub const LEAVE_TASK: &str = "leave_task";
/// Inbound: leave acknowledgment (ignored)
pub const LEFT: &str = "left";
/// Inbound: greeting sent after the namespace connect (ignored)
pub const CONNECTED: &str = "connected";
/// Outbound: mid-task directive
pub const SEND_INSTRUCTION: &str = "send_instruction";
/// Inbound: instruction accepted
pub const INSTRUCTION_RECEIVED: &str = "instruction_received";
/// Inbound: instruction refused
pub const INSTRUCTION_ERROR: &str = "instruction_error";

/// Inbound: task lifecycle
pub const AGENT_PROGRESS: &str = "agent:progress";
/// Inbound: reasoning stream
pub const AGENT_THOUGHT: &str = "agent:thought";
/// Inbound: answer stream
pub const AGENT_RESPONSE: &str = "agent:response";
/// Inbound: tool invocation notice
pub const AGENT_TOOL_CALL: &str = "agent:tool_call";
/// Inbound: tool outcome
pub const AGENT_TOOL_RESULT: &str = "agent:tool_result";

/// Every agent event a task session listens to
pub const AGENT_EVENTS: [&str; 5] = [
    AGENT_PROGRESS,
    AGENT_THOUGHT,
    AGENT_RESPONSE,
    AGENT_TOOL_CALL,
    AGENT_TOOL_RESULT,
];

// ============================================================================
// Requests
// ============================================================================

/// Body of `join_task`, `confirm_room` and `leave_task`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    /// Room to act on
    pub task_id: TaskId,
}

/// Body of `send_instruction`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionRequest {
    /// Task the instruction is for
    pub task_id: TaskId,
    /// Free-text directive
    pub instruction: String,
}

/// The `task_id` field of an inbound payload, if present
#[must_use]
pub fn task_id_of(payload: &Value) -> Option<&str> {
    payload.get("task_id").and_then(Value::as_str)
}

/// Render a loosely-typed field as display text
///
/// Strings are taken as-is; other JSON is serialized compactly.
#[must_use]
pub fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Agent payloads
// ============================================================================

/// Which token stream an event belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// `agent:thought`
    Thought,
    /// `agent:response`
    Response,
}

impl StreamKind {
    /// Wire event carrying this stream
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Thought => AGENT_THOUGHT,
            Self::Response => AGENT_RESPONSE,
        }
    }
}

/// Position of a stream event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    /// Reset the buffer
    Start,
    /// Append a fragment
    Token,
    /// Finalize the buffer
    End,
    /// Anything else the server sends
    #[serde(other)]
    Unknown,
}

/// Body of `agent:thought` and `agent:response`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPayload {
    /// Stream position
    #[serde(rename = "type")]
    pub phase: StreamPhase,
    /// Fragment carried by a token event
    #[serde(default)]
    pub token: Option<String>,
    /// Full text (accumulated on tokens, final on end)
    #[serde(default)]
    pub content: Option<String>,
    /// Status line attached to a start event
    #[serde(default)]
    pub message: Option<String>,
    /// Model run the event belongs to
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Body of `agent:tool_call`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    /// `start` or `duplicate`
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Tool name
    #[serde(default = "unknown_tool")]
    pub tool: String,
    /// Tool input, usually a display string
    #[serde(default)]
    pub input: Value,
    /// Warning text on a duplicate call
    #[serde(default)]
    pub message: Option<String>,
}

fn unknown_tool() -> String {
    "unknown".to_string()
}

impl ToolCallPayload {
    /// Whether the server flagged this call as a repeat
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.kind.as_deref() == Some("duplicate")
    }
}

/// Body of `agent:tool_result`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    /// `end` or `error`
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Display output
    #[serde(default)]
    pub output: Option<Value>,
    /// Error text
    #[serde(default)]
    pub error: Option<String>,
    /// Structured output, when the tool returned JSON
    #[serde(default)]
    pub data: Option<Value>,
}

impl ToolResultPayload {
    /// Whether the tool failed
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.kind.as_deref() == Some("error")
    }
}

/// Subtype of `agent:progress`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProgressPhase {
    /// Agent started working
    Start,
    /// Agent finished successfully
    Complete,
    /// Agent failed
    Error,
    /// An operation failed and is being retried
    Retry,
    /// Task was cancelled
    Cancelled,
    /// Agent chose a tool
    Action,
    /// Agent produced its final answer
    Finish,
    /// Unrecognized subtype
    Other(String),
}

impl ProgressPhase {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Retry => "retry",
            Self::Cancelled => "cancelled",
            Self::Action => "action",
            Self::Finish => "finish",
            Self::Other(other) => other,
        }
    }
}

impl From<String> for ProgressPhase {
    fn from(s: String) -> Self {
        match s.as_str() {
            "start" => Self::Start,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "retry" => Self::Retry,
            "cancelled" | "canceled" => Self::Cancelled,
            "action" => Self::Action,
            "finish" => Self::Finish,
            _ => Self::Other(s),
        }
    }
}

impl From<ProgressPhase> for String {
    fn from(phase: ProgressPhase) -> Self {
        phase.as_str().to_string()
    }
}

/// Body of `agent:progress`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    /// Subtype
    #[serde(rename = "type")]
    pub phase: ProgressPhase,
    /// Human-readable status line
    #[serde(default)]
    pub message: Option<String>,
    /// Error text on `error` and `retry`
    #[serde(default)]
    pub error: Option<String>,
    /// Retry attempt (1-based)
    #[serde(default)]
    pub attempt: Option<u32>,
    /// Retry budget
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Tool chosen on `action`
    #[serde(default)]
    pub tool: Option<String>,
    /// Tool input on `action`
    #[serde(default)]
    pub input: Option<Value>,
    /// Final output on `complete` and `finish`
    #[serde(default)]
    pub output: Option<Value>,
}

impl ProgressPayload {
    /// One-line description for display
    #[must_use]
    pub fn detail(&self) -> Option<String> {
        match self.phase {
            ProgressPhase::Error => self.error.clone().or_else(|| self.message.clone()),
            ProgressPhase::Retry => {
                let head = match (self.attempt, self.max_retries) {
                    (Some(a), Some(m)) => format!("retry {a}/{m}"),
                    (Some(a), None) => format!("retry {a}"),
                    _ => "retry".to_string(),
                };
                Some(match &self.error {
                    Some(e) => format!("{head}: {e}"),
                    None => head,
                })
            }
            ProgressPhase::Action => self.tool.clone(),
            _ => self.message.clone(),
        }
    }

    /// Final output as text, when present and non-empty
    #[must_use]
    pub fn output_text(&self) -> Option<String> {
        self.output
            .as_ref()
            .map(text_of)
            .filter(|text| !text.is_empty())
    }
}

/// A parsed agent event
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    /// `agent:thought` or `agent:response`
    Stream {
        /// Which stream
        kind: StreamKind,
        /// Event body
        payload: StreamPayload,
    },
    /// `agent:tool_call`
    ToolCall(ToolCallPayload),
    /// `agent:tool_result`
    ToolResult(ToolResultPayload),
    /// `agent:progress`
    Progress(ProgressPayload),
}

impl AgentEvent {
    /// Parse a named wire event
    ///
    /// Returns `Ok(None)` for events that are not agent events.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when an agent event's payload does not match
    /// its shape.
    pub fn from_wire(name: &str, payload: &Value) -> Result<Option<Self>, serde_json::Error> {
        let event = match name {
            AGENT_THOUGHT => Self::Stream {
                kind: StreamKind::Thought,
                payload: StreamPayload::deserialize(payload)?,
            },
            AGENT_RESPONSE => Self::Stream {
                kind: StreamKind::Response,
                payload: StreamPayload::deserialize(payload)?,
            },
            AGENT_TOOL_CALL => Self::ToolCall(ToolCallPayload::deserialize(payload)?),
            AGENT_TOOL_RESULT => Self::ToolResult(ToolResultPayload::deserialize(payload)?),
            AGENT_PROGRESS => Self::Progress(ProgressPayload::deserialize(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
