//! Instruction Channel
//!
//! Mid-task directives. Each send races three outcomes (accepted, refused,
//! timed out) and exactly one of them settles the call.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::connection::{ConnectionError, ConnectionManager};
use crate::events::{InstructionRequest, INSTRUCTION_ERROR, INSTRUCTION_RECEIVED, SEND_INSTRUCTION};
use crate::pending::{AckKind, PendingOutcome, PendingRequest};
use crate::tasks::TaskId;

/// Default wait for an instruction ack
pub const DEFAULT_INSTRUCTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Message used when the server refuses without saying why
const GENERIC_REJECTION: &str = "instruction rejected by server";

/// Server acknowledgment of an instruction
#[derive(Clone, Debug, PartialEq)]
pub struct InstructionReceipt {
    /// Task the instruction was for
    pub task_id: TaskId,
    /// Status reported by the server (`ok` when accepted)
    pub status: Option<String>,
    /// Whatever the server attached as the result
    pub result: Option<Value>,
}

/// Errors from sending an instruction
#[derive(Debug, Error)]
pub enum InstructionError {
    /// The connection is not established
    #[error("Not connected")]
    NotConnected,
    /// The server answered with `instruction_error`
    #[error("Instruction for task {task_id} rejected: {message}")]
    Rejected {
        /// Task the instruction was for
        task_id: TaskId,
        /// Server-provided reason
        message: String,
    },
    /// No answer within the timeout
    #[error("No answer for instruction to task {task_id} within {timeout:?}")]
    Timeout {
        /// Task the instruction was for
        task_id: TaskId,
        /// How long we waited
        timeout: Duration,
    },
    /// Sending failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Correlated instruction exchange on the shared connection
#[derive(Clone)]
pub struct InstructionChannel {
    connection: ConnectionManager,
    timeout: Duration,
}

impl InstructionChannel {
    /// Create a channel with the given ack timeout
    #[must_use]
    pub fn new(connection: ConnectionManager, timeout: Duration) -> Self {
        Self {
            connection,
            timeout,
        }
    }

    /// Ack timeout in use
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `instruction` to the task and wait for its answer
    ///
    /// # Errors
    ///
    /// - `InstructionError::NotConnected` without a connection
    /// - `InstructionError::Rejected` on `instruction_error` for this task
    /// - `InstructionError::Timeout` when neither ack arrives in time
    pub async fn send_instruction(
        &self,
        task_id: &TaskId,
        instruction: &str,
    ) -> Result<InstructionReceipt, InstructionError> {
        if !self.connection.is_connected() {
            return Err(InstructionError::NotConnected);
        }

        let pending =
            PendingRequest::new(self.connection.listeners(), task_id.clone(), self.timeout)
                .watch(INSTRUCTION_RECEIVED, AckKind::Success)
                .watch(INSTRUCTION_ERROR, AckKind::Failure);

        let request = InstructionRequest {
            task_id: task_id.clone(),
            instruction: instruction.to_string(),
        };
        self.connection.emit_json(SEND_INSTRUCTION, &request).await?;
        tracing::debug!(task_id = %task_id, "Instruction sent");

        match pending.wait().await {
            PendingOutcome::Resolved {
                kind: AckKind::Success,
                payload,
            } => {
                tracing::info!(task_id = %task_id, "Instruction accepted");
                Ok(InstructionReceipt {
                    task_id: task_id.clone(),
                    status: payload
                        .get("status")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    result: payload.get("result").filter(|v| !v.is_null()).cloned(),
                })
            }
            PendingOutcome::Resolved {
                kind: AckKind::Failure,
                payload,
            } => {
                let message = payload
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty())
                    .unwrap_or(GENERIC_REJECTION)
                    .to_string();
                tracing::warn!(task_id = %task_id, error = %message, "Instruction rejected");
                Err(InstructionError::Rejected {
                    task_id: task_id.clone(),
                    message,
                })
            }
            PendingOutcome::TimedOut => {
                tracing::warn!(task_id = %task_id, timeout = ?self.timeout, "Instruction timed out");
                Err(InstructionError::Timeout {
                    task_id: task_id.clone(),
                    timeout: self.timeout,
                })
            }
        }
    }
}
