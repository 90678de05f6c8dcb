//! TaskRoom Core - Real-Time Task Session Client
//!
//! Client side of a task-execution server: one shared connection per
//! process, per-task rooms on top of it, deduplicated event listeners and
//! assembly of the server's token streams into finished messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      UI / CLI (one per task)                     │
//! │   TaskSession ── next() ──► AssemblerOutput ──► Message list     │
//! └──────────────┬───────────────────────────────────────────────────┘
//!                │ lease / join / instruct
//! ┌──────────────┴───────────────────────────────────────────────────┐
//! │                            Client                                │
//! │  ┌──────────────┐ ┌───────────────┐ ┌────────────────────────┐   │
//! │  │RoomCoordinator│ │InstructionChan│ │  ReconnectSupervisor  │   │
//! │  └──────┬───────┘ └──────┬────────┘ └──────────┬─────────────┘   │
//! │         └────────────────┼─────────────────────┘                 │
//! │                 ┌────────┴──────────┐                            │
//! │                 │ ConnectionManager │ ── ListenerRegistry        │
//! │                 └────────┬──────────┘                            │
//! └──────────────────────────┼───────────────────────────────────────┘
//!                            │ EventTransport (Socket.IO / in-process)
//!                       task server
//! ```
//!
//! # Task start ordering
//!
//! [`TaskApi::init`] creates a task without running it, the session joins
//! the task's room, and only then [`TaskApi::start`] runs it.
//!
//! # Module Overview
//!
//! - [`transport`]: wire transports and the event dispatcher
//! - [`connection`]: the shared connection, leases and teardown
//! - [`listeners`]: reference-counted listener bindings
//! - [`rooms`]: task room membership
//! - [`instructions`]: mid-task instructions
//! - [`reconnect`]: reconnection supervision
//! - [`streaming`]: event-to-message assembly
//! - [`session`] / [`client`]: the surfaces UI code uses
//! - [`api`]: the task HTTP endpoints
//! - [`config`]: layered configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod instructions;
pub mod listeners;
pub mod messages;
pub mod pending;
pub mod reconnect;
pub mod rooms;
pub mod session;
pub mod streaming;
pub mod tasks;
pub mod transport;

// Re-exports for convenience
pub use api::{ApiError, TaskAck, TaskApi, TaskStatusReport};
pub use client::Client;
pub use config::{
    default_config_path, load_config, load_config_from_path, ClientConfig, ClientToml,
    ConfigError, ConfigOverrides, ConfigSource,
};
pub use connection::{ConnectionError, ConnectionEvent, ConnectionLease, ConnectionManager};
pub use events::{AgentEvent, ProgressPhase, StreamKind};
pub use instructions::{InstructionChannel, InstructionError, InstructionReceipt};
pub use listeners::{ListenerOwner, ListenerRegistry};
pub use messages::{Message, StreamUpdate};
pub use reconnect::{ReconnectState, ReconnectSupervisor, SupervisorConfig, SupervisorHandle};
pub use rooms::{RoomConfig, RoomCoordinator, RoomError, ACK_TOLERANT};
pub use session::{SessionError, TaskSession};
pub use streaming::{AssemblerOutput, StreamAssembler, StreamBuffer};
pub use tasks::{TaskId, TaskState, TaskStatus, TransitionError};
pub use transport::{
    DisconnectReason, EnvironmentMode, EventTransport, InProcessServer, InProcessTransport,
    TransportConfig, TransportError,
};
