//! Task Session
//!
//! One mounted view of one task. A session holds a lease on the shared
//! connection, its own listener owner for the agent events, the room
//! membership and the assembler that turns events into messages.
//!
//! Listeners are armed before the room is joined, so nothing the server
//! sends after `joined` is lost.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::client::Client;
use crate::connection::{ConnectionError, ConnectionLease};
use crate::events::{task_id_of, StreamKind, AGENT_EVENTS};
use crate::instructions::{InstructionChannel, InstructionError, InstructionReceipt};
use crate::listeners::ListenerOwner;
use crate::messages::Message;
use crate::rooms::{RoomCoordinator, RoomError};
use crate::streaming::{AssemblerOutput, StreamAssembler, StreamBuffer};
use crate::tasks::{TaskId, TaskState, TaskStatus};
use crate::transport::Callback;

/// Icon on the notice appended after an accepted instruction
const INSTRUCTION_ICON: &str = "📨";

/// Errors from session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connecting failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Joining the room failed
    #[error(transparent)]
    Room(#[from] RoomError),
    /// The instruction was not accepted
    #[error(transparent)]
    Instruction(#[from] InstructionError),
}

/// A live view of one task
pub struct TaskSession {
    task_id: TaskId,
    lease: Option<ConnectionLease>,
    rooms: RoomCoordinator,
    instructions: InstructionChannel,
    owner: ListenerOwner,
    events: mpsc::UnboundedReceiver<(String, Value)>,
    assembler: StreamAssembler,
    closed: bool,
}

impl TaskSession {
    /// Open a session: lease, connect, listen, join and confirm
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Connection` if the connection cannot be
    /// established and `SessionError::Room` if joining fails. The lease is
    /// released on failure.
    pub async fn open(client: &Client, task_id: TaskId) -> Result<Self, SessionError> {
        let connection = client.connection();
        let lease = connection.lease();
        connection.connect().await?;

        let owner = connection.listeners().owner();
        let (tx, events) = mpsc::unbounded_channel();
        for event in AGENT_EVENTS {
            let tx = tx.clone();
            let own_task = task_id.clone();
            let callback = Callback::new(move |payload| {
                // Agent payloads rarely carry a task id; drop the ones that
                // name a different task
                if task_id_of(payload).is_some_and(|id| id != own_task.as_str()) {
                    return;
                }
                let _ = tx.send((event.to_string(), payload.clone()));
            });
            owner.on(event, &callback);
        }

        let rooms = client.rooms().clone();
        rooms.join_task(&task_id).await?;
        if let Err(e) = rooms.confirm_room(&task_id).await {
            rooms.leave_task(&task_id).await;
            return Err(e.into());
        }
        tracing::info!(task_id = %task_id, owner = %owner.id(), "Session opened");

        Ok(Self {
            assembler: StreamAssembler::new(task_id.clone()),
            task_id,
            lease: Some(lease),
            rooms,
            instructions: client.instructions().clone(),
            owner,
            events,
            closed: false,
        })
    }

    /// Task this session follows
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Task state so far
    #[must_use]
    pub fn task(&self) -> &TaskState {
        self.assembler.task()
    }

    /// Current task status
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.assembler.status()
    }

    /// Finalized messages in arrival order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.assembler.messages()
    }

    /// In-progress stream buffer
    #[must_use]
    pub fn buffer(&self, kind: StreamKind) -> &StreamBuffer {
        self.assembler.buffer(kind)
    }

    /// Mark the task as starting, right before asking the server to run it
    pub fn begin(&mut self) -> Vec<AssemblerOutput> {
        self.assembler.begin()
    }

    /// Wait for the next agent event and apply it
    ///
    /// Returns `None` once the session can receive nothing more.
    pub async fn next(&mut self) -> Option<Vec<AssemblerOutput>> {
        let (name, payload) = self.events.recv().await?;
        Some(self.assembler.apply_wire(&name, &payload))
    }

    /// Apply every event already queued without waiting
    pub fn drain(&mut self) -> Vec<AssemblerOutput> {
        let mut out = Vec::new();
        while let Ok((name, payload)) = self.events.try_recv() {
            out.extend(self.assembler.apply_wire(&name, &payload));
        }
        out
    }

    /// Send an instruction to the running task
    ///
    /// On acceptance a system notice is appended to the transcript.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Instruction` when the instruction is refused,
    /// times out or cannot be sent.
    pub async fn send_instruction(
        &mut self,
        text: &str,
    ) -> Result<InstructionReceipt, SessionError> {
        let receipt = self
            .instructions
            .send_instruction(&self.task_id, text)
            .await?;
        self.assembler
            .push_system(format!("Instruction sent: {text}"), Some(INSTRUCTION_ICON));
        Ok(receipt)
    }

    /// Leave the room, drop the listeners and release the connection
    ///
    /// The connection itself stays up for the teardown grace window.
    pub async fn close(mut self) {
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rooms.leave_task(&self.task_id).await;
        let removed = self.owner.cleanup();
        self.lease.take();
        tracing::info!(task_id = %self.task_id, removed, "Session closed");
    }
}

impl Drop for TaskSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Listeners and lease go with the fields; the leave needs a runtime
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let rooms = self.rooms.clone();
            let task_id = self.task_id.clone();
            runtime.spawn(async move { rooms.leave_task(&task_id).await });
        }
    }
}
