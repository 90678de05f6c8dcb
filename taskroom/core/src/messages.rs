//! Domain Messages
//!
//! Finalized records handed to the UI layer. A message is immutable once
//! produced; the transcript is append-only in arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{ProgressPhase, StreamKind};

/// A finalized transcript entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Completed reasoning block
    Thought {
        /// Full reasoning text
        content: String,
    },
    /// Completed answer block
    Response {
        /// Full answer text
        content: String,
    },
    /// The agent invoked a tool
    ToolCall {
        /// Tool name
        name: String,
        /// Tool input as sent by the server
        input: Value,
    },
    /// A tool finished
    ToolResult {
        /// Display output on success
        output: Option<String>,
        /// Error text on failure
        error: Option<String>,
        /// Whether the tool failed
        is_error: bool,
        /// Structured output, when the tool returned JSON
        data: Option<Value>,
    },
    /// Locally generated notice
    System {
        /// Notice text
        content: String,
        /// Optional leading icon
        icon: Option<String>,
    },
    /// Task lifecycle marker
    Progress {
        /// Progress subtype
        phase: ProgressPhase,
        /// One-line detail
        detail: Option<String>,
    },
}

impl Message {
    /// A system notice
    pub fn system(content: impl Into<String>, icon: Option<&str>) -> Self {
        Self::System {
            content: content.into(),
            icon: icon.map(str::to_string),
        }
    }

    /// Short variant name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thought { .. } => "thought",
            Self::Response { .. } => "response",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::System { .. } => "system",
            Self::Progress { .. } => "progress",
        }
    }

    /// Single-line rendering for plain-text surfaces
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Thought { content } => format!("[thinking] {content}"),
            Self::Response { content } => content.clone(),
            Self::ToolCall { name, input } => match input {
                Value::Null => format!("[tool] {name}"),
                Value::String(s) => format!("[tool] {name}({s})"),
                other => format!("[tool] {name}({other})"),
            },
            Self::ToolResult {
                is_error: true,
                error,
                ..
            } => format!("[tool error] {}", error.as_deref().unwrap_or("unknown error")),
            Self::ToolResult { output, .. } => {
                format!("[tool result] {}", output.as_deref().unwrap_or_default())
            }
            Self::System { content, icon } => match icon {
                Some(icon) => format!("{icon} {content}"),
                None => content.clone(),
            },
            Self::Progress { phase, detail } => match detail {
                Some(detail) => format!("[{}] {detail}", phase.as_str()),
                None => format!("[{}]", phase.as_str()),
            },
        }
    }
}

/// Incremental stream progress (not a transcript entry)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamUpdate {
    /// Which stream grew
    pub kind: StreamKind,
    /// Fragment just appended
    pub fragment: String,
    /// Buffer content so far
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serializes_with_type_tag() {
        let msg = Message::Thought {
            content: "Hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "thought", "content": "Hi"})
        );

        let msg = Message::Progress {
            phase: ProgressPhase::Error,
            detail: Some("boom".into()),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "progress", "phase": "error", "detail": "boom"})
        );
    }

    #[test]
    fn test_summary() {
        assert_eq!(
            Message::system("instruction sent", Some("📨")).summary(),
            "📨 instruction sent"
        );
        assert_eq!(
            Message::ToolCall {
                name: "search".into(),
                input: json!("cats")
            }
            .summary(),
            "[tool] search(cats)"
        );
        assert_eq!(
            Message::ToolResult {
                output: None,
                error: Some("timeout".into()),
                is_error: true,
                data: None,
            }
            .summary(),
            "[tool error] timeout"
        );
        assert_eq!(
            Message::Progress {
                phase: ProgressPhase::Complete,
                detail: None
            }
            .kind(),
            "progress"
        );
    }
}
