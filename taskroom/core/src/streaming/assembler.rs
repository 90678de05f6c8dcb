//! Stream Assembler Implementation
//!
//! Folds one task's agent events into finalized messages and the task state.

use tokio::time::Instant;

use serde_json::Value;

use crate::events::{
    text_of, AgentEvent, ProgressPayload, ProgressPhase, StreamKind, StreamPayload, StreamPhase,
    ToolCallPayload, ToolResultPayload,
};
use crate::messages::{Message, StreamUpdate};
use crate::tasks::{TaskId, TaskState, TaskStatus, TransitionError};

/// Icon for server warnings about repeated tool calls
const DUPLICATE_ICON: &str = "⚠️";

// ============================================================================
// Stream Buffer
// ============================================================================

/// Accumulates one stream's tokens between `start` and `end`
#[derive(Clone, Debug, Default)]
pub struct StreamBuffer {
    content: String,
    tokens: u32,
    started_at: Option<Instant>,
    active: bool,
}

impl StreamBuffer {
    /// Accumulated text
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Tokens received since the last reset
    #[must_use]
    pub fn token_count(&self) -> u32 {
        self.tokens
    }

    /// When the current stream began
    #[must_use]
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Whether a stream is in progress
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    fn reset(&mut self) {
        self.content.clear();
        self.tokens = 0;
        self.started_at = Some(Instant::now());
        self.active = true;
    }

    fn push(&mut self, token: &str) {
        if !self.active {
            self.reset();
        }
        self.content.push_str(token);
        self.tokens += 1;
    }

    /// Take the finished text, leaving the buffer empty and inactive
    fn finish(&mut self) -> String {
        self.active = false;
        self.tokens = 0;
        self.started_at = None;
        std::mem::take(&mut self.content)
    }
}

// ============================================================================
// Outputs
// ============================================================================

/// What applying one event produced
#[derive(Clone, Debug, PartialEq)]
pub enum AssemblerOutput {
    /// A stream grew
    Update(StreamUpdate),
    /// A message was appended to the transcript
    Message(Message),
    /// The task moved between statuses
    Status {
        /// Previous status
        from: TaskStatus,
        /// New status
        to: TaskStatus,
    },
    /// The event asked for a transition the task does not allow
    TransitionRejected {
        /// Status the task stays in
        from: TaskStatus,
        /// Status that was refused
        to: TaskStatus,
    },
}

// ============================================================================
// Stream Assembler
// ============================================================================

/// Per-task event folder
///
/// Holds one buffer per stream kind, the task state and the transcript.
#[derive(Debug)]
pub struct StreamAssembler {
    task: TaskState,
    thought: StreamBuffer,
    response: StreamBuffer,
    transcript: Vec<Message>,
}

impl StreamAssembler {
    /// Start assembling for `task_id`
    #[must_use]
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task: TaskState::new(task_id),
            thought: StreamBuffer::default(),
            response: StreamBuffer::default(),
            transcript: Vec::new(),
        }
    }

    /// Task state so far
    #[must_use]
    pub fn task(&self) -> &TaskState {
        &self.task
    }

    /// Current task status
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    /// Finalized messages in arrival order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.transcript
    }

    /// Buffer for one stream kind
    #[must_use]
    pub fn buffer(&self, kind: StreamKind) -> &StreamBuffer {
        match kind {
            StreamKind::Thought => &self.thought,
            StreamKind::Response => &self.response,
        }
    }

    fn buffer_mut(&mut self, kind: StreamKind) -> &mut StreamBuffer {
        match kind {
            StreamKind::Thought => &mut self.thought,
            StreamKind::Response => &mut self.response,
        }
    }

    /// Mark the task as started locally (`idle -> starting`)
    pub fn begin(&mut self) -> Vec<AssemblerOutput> {
        let mut out = Vec::new();
        self.transition(TaskStatus::Starting, &mut out);
        out
    }

    /// Append a locally generated notice
    pub fn push_system(&mut self, content: impl Into<String>, icon: Option<&str>) -> Message {
        let message = Message::system(content, icon);
        self.transcript.push(message.clone());
        message
    }

    /// Parse and apply a named wire event
    ///
    /// Non-agent events and malformed payloads produce nothing.
    pub fn apply_wire(&mut self, name: &str, payload: &Value) -> Vec<AssemblerOutput> {
        match AgentEvent::from_wire(name, payload) {
            Ok(Some(event)) => self.apply(event),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(event = name, error = %e, "Malformed agent event dropped");
                Vec::new()
            }
        }
    }

    /// Apply one agent event
    pub fn apply(&mut self, event: AgentEvent) -> Vec<AssemblerOutput> {
        let mut out = Vec::new();
        match event {
            AgentEvent::Stream { kind, payload } => self.on_stream(kind, payload, &mut out),
            AgentEvent::ToolCall(call) => self.on_tool_call(call, &mut out),
            AgentEvent::ToolResult(result) => self.on_tool_result(result, &mut out),
            AgentEvent::Progress(progress) => self.on_progress(progress, &mut out),
        }
        out
    }

    fn on_stream(
        &mut self,
        kind: StreamKind,
        payload: StreamPayload,
        out: &mut Vec<AssemblerOutput>,
    ) {
        match payload.phase {
            StreamPhase::Start => {
                self.buffer_mut(kind).reset();
                tracing::debug!(task_id = %self.task.task_id, stream = ?kind, "Stream started");
            }
            StreamPhase::Token => {
                let Some(token) = payload.token else {
                    return;
                };
                if matches!(self.task.status, TaskStatus::Idle | TaskStatus::Starting) {
                    self.transition(TaskStatus::Running, out);
                }

                let buffer = self.buffer_mut(kind);
                buffer.push(&token);
                tracing::trace!(stream = ?kind, tokens = buffer.token_count(), "Token");
                let content = buffer.content().to_string();
                out.push(AssemblerOutput::Update(StreamUpdate {
                    kind,
                    fragment: token,
                    content,
                }));
            }
            StreamPhase::End => {
                let buffered = self.buffer_mut(kind).finish();
                let content = payload
                    .content
                    .filter(|c| !c.is_empty())
                    .unwrap_or(buffered);
                if content.is_empty() {
                    return;
                }

                let message = match kind {
                    StreamKind::Thought => Message::Thought { content },
                    StreamKind::Response => Message::Response { content },
                };
                self.append(message, out);
            }
            StreamPhase::Unknown => {
                tracing::debug!(stream = ?kind, "Unknown stream phase ignored");
            }
        }
    }

    fn on_tool_call(&mut self, call: ToolCallPayload, out: &mut Vec<AssemblerOutput>) {
        let message = if call.is_duplicate() {
            let text = call
                .message
                .unwrap_or_else(|| format!("Repeated call to {}", call.tool));
            Message::system(text, Some(DUPLICATE_ICON))
        } else {
            Message::ToolCall {
                name: call.tool,
                input: call.input,
            }
        };
        self.append(message, out);
    }

    fn on_tool_result(&mut self, result: ToolResultPayload, out: &mut Vec<AssemblerOutput>) {
        let is_error = result.is_error();
        let message = Message::ToolResult {
            output: result.output.as_ref().map(text_of),
            error: result.error,
            is_error,
            data: result.data,
        };
        self.append(message, out);
    }

    fn on_progress(&mut self, progress: ProgressPayload, out: &mut Vec<AssemblerOutput>) {
        let from = self.task.status;
        let applied = match progress.phase {
            ProgressPhase::Start => self
                .task
                .transition(TaskStatus::Running)
                .map(|_| TaskStatus::Running),
            ProgressPhase::Complete => self
                .task
                .complete(progress.output_text())
                .map(|_| TaskStatus::Complete),
            ProgressPhase::Error => {
                let error = progress
                    .detail()
                    .unwrap_or_else(|| "unknown error".to_string());
                self.task.fail(error).map(|_| TaskStatus::Error)
            }
            ProgressPhase::Retry => self
                .task
                .retry(progress.attempt.unwrap_or(self.task.attempt + 1), progress.max_retries)
                .map(|_| TaskStatus::Running),
            ProgressPhase::Cancelled => self
                .task
                .transition(TaskStatus::Cancelled)
                .map(|_| TaskStatus::Cancelled),
            ProgressPhase::Action | ProgressPhase::Finish | ProgressPhase::Other(_) => Ok(from),
        };

        match applied {
            Ok(to) => {
                if to != from {
                    tracing::info!(task_id = %self.task.task_id, %from, %to, "Task status changed");
                    out.push(AssemblerOutput::Status { from, to });
                }
            }
            Err(rejected) => {
                self.reject(rejected, out);
                return;
            }
        }

        let detail = progress.detail();
        self.append(
            Message::Progress {
                phase: progress.phase,
                detail,
            },
            out,
        );
    }

    fn transition(&mut self, to: TaskStatus, out: &mut Vec<AssemblerOutput>) {
        match self.task.transition(to) {
            Ok(from) => {
                if from != to {
                    tracing::info!(task_id = %self.task.task_id, %from, %to, "Task status changed");
                    out.push(AssemblerOutput::Status { from, to });
                }
            }
            Err(rejected) => self.reject(rejected, out),
        }
    }

    fn reject(&self, rejected: TransitionError, out: &mut Vec<AssemblerOutput>) {
        tracing::warn!(task_id = %self.task.task_id, error = %rejected, "Transition rejected");
        out.push(AssemblerOutput::TransitionRejected {
            from: rejected.from,
            to: rejected.to,
        });
    }

    fn append(&mut self, message: Message, out: &mut Vec<AssemblerOutput>) {
        tracing::debug!(task_id = %self.task.task_id, kind = message.kind(), "Message");
        self.transcript.push(message.clone());
        out.push(AssemblerOutput::Message(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        AGENT_PROGRESS, AGENT_RESPONSE, AGENT_THOUGHT, AGENT_TOOL_CALL, AGENT_TOOL_RESULT,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn assembler() -> StreamAssembler {
        StreamAssembler::new(TaskId::new("t1"))
    }

    fn messages_of(outputs: &[AssemblerOutput]) -> Vec<&Message> {
        outputs
            .iter()
            .filter_map(|o| match o {
                AssemblerOutput::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_tokens_fold_into_one_message() {
        let mut asm = assembler();
        asm.apply_wire(AGENT_THOUGHT, &json!({"type": "start"}));
        let first = asm.apply_wire(AGENT_THOUGHT, &json!({"type": "token", "token": "a"}));
        let second = asm.apply_wire(AGENT_THOUGHT, &json!({"type": "token", "token": "b"}));
        assert!(messages_of(&first).is_empty());
        assert_eq!(
            second.last(),
            Some(&AssemblerOutput::Update(StreamUpdate {
                kind: StreamKind::Thought,
                fragment: "b".into(),
                content: "ab".into(),
            }))
        );

        let end = asm.apply_wire(AGENT_THOUGHT, &json!({"type": "end"}));
        assert_eq!(
            messages_of(&end),
            vec![&Message::Thought {
                content: "ab".into()
            }]
        );
        assert_eq!(asm.messages().len(), 1);
        assert!(asm.buffer(StreamKind::Thought).is_empty());
        assert!(!asm.buffer(StreamKind::Thought).is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_start_time_follows_runtime_clock() {
        let mut asm = assembler();
        assert_eq!(asm.buffer(StreamKind::Response).started_at(), None);

        let started = Instant::now();
        asm.apply_wire(AGENT_RESPONSE, &json!({"type": "start"}));
        tokio::time::advance(Duration::from_secs(3)).await;
        asm.apply_wire(AGENT_RESPONSE, &json!({"type": "token", "token": "x"}));

        let began = asm.buffer(StreamKind::Response).started_at().unwrap();
        assert_eq!(began, started);
        assert_eq!(began.elapsed(), Duration::from_secs(3));

        asm.apply_wire(AGENT_RESPONSE, &json!({"type": "end"}));
        assert_eq!(asm.buffer(StreamKind::Response).started_at(), None);
    }

    #[test]
    fn test_end_with_empty_buffer_emits_nothing() {
        let mut asm = assembler();
        asm.apply_wire(AGENT_RESPONSE, &json!({"type": "start"}));
        let out = asm.apply_wire(AGENT_RESPONSE, &json!({"type": "end"}));
        assert!(out.is_empty());
        assert!(asm.messages().is_empty());
    }

    #[test]
    fn test_explicit_final_content_wins() {
        let mut asm = assembler();
        asm.apply_wire(AGENT_RESPONSE, &json!({"type": "token", "token": "draf"}));
        asm.apply_wire(
            AGENT_RESPONSE,
            &json!({"type": "end", "content": "Final answer"}),
        );
        assert_eq!(
            asm.messages(),
            &[Message::Response {
                content: "Final answer".into()
            }]
        );

        asm.apply_wire(AGENT_RESPONSE, &json!({"type": "token", "token": "kept"}));
        asm.apply_wire(AGENT_RESPONSE, &json!({"type": "end", "content": ""}));
        assert_eq!(
            asm.messages()[1],
            Message::Response {
                content: "kept".into()
            }
        );
    }

    #[test]
    fn test_streams_are_independent() {
        let mut asm = assembler();
        asm.apply_wire(AGENT_THOUGHT, &json!({"type": "token", "token": "think"}));
        asm.apply_wire(AGENT_RESPONSE, &json!({"type": "token", "token": "say"}));
        asm.apply_wire(AGENT_THOUGHT, &json!({"type": "end"}));

        assert_eq!(asm.buffer(StreamKind::Response).content(), "say");
        assert_eq!(asm.buffer(StreamKind::Response).token_count(), 1);
        assert_eq!(
            asm.messages(),
            &[Message::Thought {
                content: "think".into()
            }]
        );
    }

    #[test]
    fn test_start_resets_partial_stream() {
        let mut asm = assembler();
        asm.apply_wire(AGENT_THOUGHT, &json!({"type": "token", "token": "stale"}));
        asm.apply_wire(AGENT_THOUGHT, &json!({"type": "start"}));
        asm.apply_wire(AGENT_THOUGHT, &json!({"type": "token", "token": "fresh"}));
        asm.apply_wire(AGENT_THOUGHT, &json!({"type": "end"}));
        assert_eq!(
            asm.messages(),
            &[Message::Thought {
                content: "fresh".into()
            }]
        );
    }

    #[test]
    fn test_first_token_marks_task_running() {
        let mut asm = assembler();
        asm.begin();
        let out = asm.apply_wire(AGENT_RESPONSE, &json!({"type": "token", "token": "x"}));
        assert_eq!(
            out[0],
            AssemblerOutput::Status {
                from: TaskStatus::Starting,
                to: TaskStatus::Running
            }
        );
        assert_eq!(asm.status(), TaskStatus::Running);
    }

    #[test]
    fn test_tool_events_map_to_messages() {
        let mut asm = assembler();
        asm.apply_wire(
            AGENT_TOOL_CALL,
            &json!({"type": "start", "tool": "search", "input": {"q": "rust"}}),
        );
        asm.apply_wire(
            AGENT_TOOL_RESULT,
            &json!({"type": "end", "output": "3 hits", "data": {"hits": 3}}),
        );
        asm.apply_wire(
            AGENT_TOOL_RESULT,
            &json!({"type": "error", "error": "quota exceeded"}),
        );

        assert_eq!(
            asm.messages(),
            &[
                Message::ToolCall {
                    name: "search".into(),
                    input: json!({"q": "rust"}),
                },
                Message::ToolResult {
                    output: Some("3 hits".into()),
                    error: None,
                    is_error: false,
                    data: Some(json!({"hits": 3})),
                },
                Message::ToolResult {
                    output: None,
                    error: Some("quota exceeded".into()),
                    is_error: true,
                    data: None,
                },
            ]
        );
    }

    #[test]
    fn test_duplicate_tool_call_becomes_warning() {
        let mut asm = assembler();
        asm.apply_wire(
            AGENT_TOOL_CALL,
            &json!({"type": "duplicate", "tool": "search", "message": "Already searched"}),
        );
        assert_eq!(
            asm.messages(),
            &[Message::System {
                content: "Already searched".into(),
                icon: Some(DUPLICATE_ICON.into()),
            }]
        );
    }

    #[test]
    fn test_progress_error_is_final() {
        let mut asm = assembler();
        asm.apply_wire(AGENT_PROGRESS, &json!({"type": "start", "message": "go"}));
        asm.apply_wire(
            AGENT_PROGRESS,
            &json!({"type": "error", "error": "boom", "message": "Task failed: boom"}),
        );
        assert_eq!(asm.status(), TaskStatus::Error);
        assert_eq!(asm.task().error.as_deref(), Some("boom"));

        let late = asm.apply_wire(AGENT_PROGRESS, &json!({"type": "complete", "output": "x"}));
        assert_eq!(
            late,
            vec![AssemblerOutput::TransitionRejected {
                from: TaskStatus::Error,
                to: TaskStatus::Complete
            }]
        );
        assert_eq!(asm.status(), TaskStatus::Error);
        assert_eq!(asm.messages().len(), 2);
    }

    #[test]
    fn test_retry_keeps_task_running() {
        let mut asm = assembler();
        asm.apply_wire(AGENT_PROGRESS, &json!({"type": "start"}));
        let out = asm.apply_wire(
            AGENT_PROGRESS,
            &json!({"type": "retry", "attempt": 2, "max_retries": 3, "error": "timeout"}),
        );
        assert_eq!(asm.status(), TaskStatus::Running);
        assert_eq!(asm.task().attempt, 2);
        assert_eq!(asm.task().max_retries, Some(3));
        assert_eq!(
            messages_of(&out),
            vec![&Message::Progress {
                phase: ProgressPhase::Retry,
                detail: Some("retry 2/3: timeout".into()),
            }]
        );
    }

    #[test]
    fn test_complete_records_output() {
        let mut asm = assembler();
        asm.apply_wire(AGENT_PROGRESS, &json!({"type": "start"}));
        asm.apply_wire(
            AGENT_PROGRESS,
            &json!({"type": "complete", "success": true, "output": "done"}),
        );
        assert_eq!(asm.status(), TaskStatus::Complete);
        assert_eq!(asm.task().output.as_deref(), Some("done"));
        assert!(asm.task().finished_at.is_some());
    }

    #[test]
    fn test_cancelled_then_tokens_do_not_revive_task() {
        let mut asm = assembler();
        asm.apply_wire(AGENT_PROGRESS, &json!({"type": "cancelled", "message": "stop"}));
        asm.apply_wire(AGENT_RESPONSE, &json!({"type": "token", "token": "late"}));
        assert_eq!(asm.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_malformed_and_foreign_events_are_ignored() {
        let mut asm = assembler();
        assert!(asm.apply_wire("joined", &json!({"task_id": "t1"})).is_empty());
        assert!(asm
            .apply_wire(AGENT_TOOL_CALL, &json!({"input": 1, "tool": 7}))
            .is_empty());
        assert!(asm.messages().is_empty());
    }
}
