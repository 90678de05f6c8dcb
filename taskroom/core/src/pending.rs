//! Correlated Waits
//!
//! A `PendingRequest` is one in-flight exchange keyed by task id: it binds
//! temporary listeners for the possible answers, resolves on the first
//! matching one or on its deadline, and releases the listeners either way.
//!
//! Listeners must be armed before the request is emitted so that a fast
//! answer is not missed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::events::task_id_of;
use crate::listeners::{ListenerOwner, ListenerRegistry};
use crate::tasks::TaskId;
use crate::transport::Callback;

/// Which kind of answer arrived
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckKind {
    /// The request was accepted
    Success,
    /// The request was refused
    Failure,
}

/// How a pending request ended
#[derive(Clone, Debug, PartialEq)]
pub enum PendingOutcome {
    /// A matching answer arrived first
    Resolved {
        /// Answer kind
        kind: AckKind,
        /// Answer payload
        payload: Value,
    },
    /// The deadline passed first
    TimedOut,
}

type Slot = Arc<Mutex<Option<oneshot::Sender<(AckKind, Value)>>>>;

/// An in-flight exchange awaiting its answer
pub struct PendingRequest {
    key: TaskId,
    owner: ListenerOwner,
    slot: Slot,
    answer: oneshot::Receiver<(AckKind, Value)>,
    timeout: Duration,
    deadline: Instant,
}

impl PendingRequest {
    /// Start a request keyed by `key` that expires after `timeout`
    #[must_use]
    pub fn new(registry: &ListenerRegistry, key: TaskId, timeout: Duration) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            key,
            owner: registry.owner(),
            slot: Arc::new(Mutex::new(Some(tx))),
            answer: rx,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Resolve with `kind` when `event` arrives for this request's key
    ///
    /// Answers for other task ids are ignored. The first matching answer
    /// across all watched events wins.
    #[must_use]
    pub fn watch(self, event: &str, kind: AckKind) -> Self {
        let key = self.key.clone();
        let slot = Arc::clone(&self.slot);
        let callback = Callback::new(move |payload| {
            if task_id_of(payload) != Some(key.as_str()) {
                return;
            }
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send((kind, payload.clone()));
            }
        });
        self.owner.on(event, &callback);
        self
    }

    /// Task id this request is keyed by
    #[must_use]
    pub fn key(&self) -> &TaskId {
        &self.key
    }

    /// Configured timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the first answer or the deadline, then release the listeners
    pub async fn wait(self) -> PendingOutcome {
        let outcome = match tokio::time::timeout_at(self.deadline, self.answer).await {
            Ok(Ok((kind, payload))) => PendingOutcome::Resolved { kind, payload },
            Ok(Err(_)) | Err(_) => PendingOutcome::TimedOut,
        };
        self.owner.cleanup();
        outcome
    }
}
