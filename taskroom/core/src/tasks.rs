//! Task Lifecycle
//!
//! The client's view of one unit of server-side work. The server owns the
//! task; the client tracks its status from the event stream and never
//! reopens a finished task.
//!
//! ```text
//!   Idle ──► Starting ──► Running ──┬──► Complete
//!     │          │         ▲   │    ├──► Error
//!     └──────────┴─────────┘   └────┴──► Cancelled
//!                        (retry keeps Running)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Task identifier, as issued by the server
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a task ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Status of a task as seen by the client
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Known but not started
    #[default]
    Idle,
    /// Start requested, no activity seen yet
    Starting,
    /// Producing events
    Running,
    /// Finished successfully
    Complete,
    /// Failed
    Error,
    /// Cancelled
    Cancelled,
}

impl TaskStatus {
    /// Parse a status reported by the task API
    ///
    /// Unknown strings map to `Idle`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "starting" => Self::Starting,
            "running" => Self::Running,
            "complete" | "completed" | "done" => Self::Complete,
            "error" | "failed" => Self::Error,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Idle,
        }
    }

    /// Whether moving from `self` to `to` is allowed
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use TaskStatus::{Cancelled, Complete, Error, Idle, Running, Starting};
        match (self, to) {
            (Complete | Error | Cancelled, _) => false,
            (_, Idle) => false,
            (Idle, _) => true,
            (Starting, Starting) => false,
            (Starting, _) => true,
            (Running, Starting) => false,
            (Running, _) => true,
        }
    }

    /// Unicode status icon
    #[must_use]
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Idle => "\u{23f8}",       // pause
            Self::Starting => "\u{23f3}",   // hourglass
            Self::Running => "\u{1f504}",   // counterclockwise arrows
            Self::Complete => "\u{2705}",   // check mark
            Self::Error => "\u{274c}",      // cross mark
            Self::Cancelled => "\u{26d4}",  // no entry
        }
    }

    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Complete => "Complete",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether no further transitions are accepted
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    /// Whether the task is underway
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An illegal status change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    /// Status before the attempted change
    pub from: TaskStatus,
    /// Requested status
    pub to: TaskStatus,
}

/// Client-side task record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Task identifier
    pub task_id: TaskId,
    /// Current status
    pub status: TaskStatus,
    /// Error message when `status` is `Error`
    pub error: Option<String>,
    /// Final output reported by the agent
    pub output: Option<String>,
    /// Current retry attempt (0 when no retry happened)
    pub attempt: u32,
    /// Retry budget reported by the server
    pub max_retries: Option<u32>,
    /// When the task started running
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskState {
    /// A fresh, idle task
    #[must_use]
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Idle,
            error: None,
            output: None,
            attempt: 0,
            max_retries: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `to` if the transition table allows it
    ///
    /// # Errors
    ///
    /// Returns `TransitionError` (and leaves the state untouched) when the
    /// transition is illegal, in particular any transition out of a terminal
    /// status.
    pub fn transition(&mut self, to: TaskStatus) -> Result<TaskStatus, TransitionError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }

        self.status = to;
        if to == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(from)
    }

    /// Record a failure
    ///
    /// # Errors
    ///
    /// As [`Self::transition`].
    pub fn fail(&mut self, error: impl Into<String>) -> Result<TaskStatus, TransitionError> {
        let from = self.transition(TaskStatus::Error)?;
        self.error = Some(error.into());
        Ok(from)
    }

    /// Record a successful finish
    ///
    /// # Errors
    ///
    /// As [`Self::transition`].
    pub fn complete(&mut self, output: Option<String>) -> Result<TaskStatus, TransitionError> {
        let from = self.transition(TaskStatus::Complete)?;
        if output.is_some() {
            self.output = output;
        }
        Ok(from)
    }

    /// Record a retry; the task stays running
    ///
    /// # Errors
    ///
    /// As [`Self::transition`].
    pub fn retry(
        &mut self,
        attempt: u32,
        max_retries: Option<u32>,
    ) -> Result<TaskStatus, TransitionError> {
        let from = self.transition(TaskStatus::Running)?;
        self.attempt = attempt;
        if max_retries.is_some() {
            self.max_retries = max_retries;
        }
        Ok(from)
    }
}
