//! Physical Subscription Table
//!
//! The dispatcher is the connection's list of bound callbacks, keyed by event
//! name. It outlives individual transport links, so bindings survive a
//! reconnect. Reference counting and owner bookkeeping live one layer up in
//! [`crate::listeners::ListenerRegistry`]; this table only guarantees that a
//! given callback appears at most once per event.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Shared callback signature for inbound events
pub type CallbackFn = dyn Fn(&Value) + Send + Sync;

/// Identity of a callback (the address of its shared allocation)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(usize);

/// An event handler with stable identity
///
/// Cloning a `Callback` keeps its identity, so the same handler registered
/// twice is recognised as the same binding.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    /// Wrap a closure as a callback with a fresh identity
    pub fn new(f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Identity of this callback
    #[must_use]
    pub fn id(&self) -> CallbackId {
        CallbackId(Arc::as_ptr(&self.0).cast::<()>() as usize)
    }

    /// Invoke the callback
    pub fn call(&self, payload: &Value) {
        (self.0)(payload);
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback").field(&self.id()).finish()
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Callback {}

/// Event name → bound callbacks, in subscription order
#[derive(Clone, Default)]
pub struct Dispatcher {
    subscriptions: Arc<RwLock<HashMap<String, Vec<Callback>>>>,
}

impl Dispatcher {
    /// Create an empty dispatcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `callback` to `event`
    ///
    /// Returns `false` (and changes nothing) if that exact callback is
    /// already bound to the event.
    pub fn subscribe(&self, event: &str, callback: Callback) -> bool {
        let mut subs = self.subscriptions.write();
        let bound = subs.entry(event.to_string()).or_default();
        if bound.iter().any(|c| c == &callback) {
            return false;
        }
        bound.push(callback);
        true
    }

    /// Unbind one callback from `event`. Returns whether it was bound.
    pub fn unsubscribe(&self, event: &str, id: CallbackId) -> bool {
        let mut subs = self.subscriptions.write();
        let Some(bound) = subs.get_mut(event) else {
            return false;
        };
        let before = bound.len();
        bound.retain(|c| c.id() != id);
        let removed = bound.len() != before;
        if bound.is_empty() {
            subs.remove(event);
        }
        removed
    }

    /// Unbind every callback from `event`. Returns how many were removed.
    pub fn unsubscribe_all(&self, event: &str) -> usize {
        self.subscriptions
            .write()
            .remove(event)
            .map_or(0, |bound| bound.len())
    }

    /// Deliver an event to every bound callback
    ///
    /// The binding list is snapshotted first, so callbacks are free to
    /// unbind themselves (or others) while running. Returns how many
    /// callbacks were invoked.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let bound = match self.subscriptions.read().get(event) {
            Some(bound) => bound.clone(),
            None => {
                tracing::trace!(event, "No subscribers for event");
                return 0;
            }
        };

        for callback in &bound {
            callback.call(payload);
        }
        bound.len()
    }

    /// Number of callbacks bound to `event`
    #[must_use]
    pub fn subscription_count(&self, event: &str) -> usize {
        self.subscriptions.read().get(event).map_or(0, Vec::len)
    }

    /// Whether a specific callback is bound to `event`
    #[must_use]
    pub fn is_subscribed(&self, event: &str, id: CallbackId) -> bool {
        self.subscriptions
            .read()
            .get(event)
            .is_some_and(|bound| bound.iter().any(|c| c.id() == id))
    }

    /// Total bindings across all events
    #[must_use]
    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.read().values().map(Vec::len).sum()
    }
}
