//! Stream Assembly
//!
//! Turns a task's raw agent events into transcript messages.
//!
//! # Architecture
//!
//! ```text
//!  agent:thought ──┐                 ┌─► StreamBuffer (thought)  ─┐
//!  agent:response ─┤                 ├─► StreamBuffer (response) ─┤
//!  agent:tool_*   ─┼─► StreamAssembler                            ├─► Vec<Message>
//!  agent:progress ─┘                 └─► TaskState ───────────────┘
//! ```
//!
//! Tokens only ever produce [`StreamUpdate`](crate::messages::StreamUpdate)s;
//! a stream becomes a message once, at its `end`.

mod assembler;

pub use assembler::{AssemblerOutput, StreamAssembler, StreamBuffer};
