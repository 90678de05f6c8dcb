//! Listener Registry
//!
//! Reference-counted event bindings shared by every consumer of the
//! connection.
//!
//! Many independent consumers (session views, status widgets, the CLI) bind
//! callbacks to the same events. The registry keeps one physical subscription
//! per `(event, callback)` pair in the connection's [`Dispatcher`] and counts
//! logical references on top of it:
//!
//! ```text
//!   owner A ──on(thought, cb)──┐
//!   owner B ──on(thought, cb)──┼──► binding (thought, cb) count=2 ──► dispatcher: 1 entry
//!   registry.on(thought, cb) ──┘                                  (count=3)
//! ```
//!
//! A binding leaves the dispatcher only when its count reaches zero.
//! [`ListenerOwner`] gives each consumer a private record of what it bound so
//! that it can release exactly its own share, explicitly or on drop.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::transport::{Callback, CallbackId, Dispatcher};

struct RegistryInner {
    dispatcher: Dispatcher,
    /// event → callback → logical reference count (always ≥ 1 while present)
    bindings: Mutex<HashMap<String, HashMap<CallbackId, usize>>>,
}

/// Reference-counted view over the connection's subscription table
#[derive(Clone)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    /// Create a registry over `dispatcher`
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                dispatcher,
                bindings: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Add a reference to `(event, callback)`, binding it physically on first use
    ///
    /// Returns the binding's reference count after the call.
    pub fn on(&self, event: &str, callback: &Callback) -> usize {
        let mut bindings = self.inner.bindings.lock();
        let count = bindings
            .entry(event.to_string())
            .or_default()
            .entry(callback.id())
            .or_insert(0);

        if *count == 0 {
            self.inner.dispatcher.subscribe(event, callback.clone());
            tracing::debug!(event, "Bound listener");
        }
        *count += 1;
        *count
    }

    /// Drop a reference, or every binding for the event
    ///
    /// With a callback, decrements that binding and unbinds it physically when
    /// the count reaches zero; returns the remaining count (0 for an unknown
    /// binding, so extra calls are no-ops). Without a callback, unbinds
    /// everything bound to `event` regardless of counts and returns how many
    /// bindings were removed.
    pub fn off(&self, event: &str, callback: Option<&Callback>) -> usize {
        let mut bindings = self.inner.bindings.lock();

        let Some(callback) = callback else {
            let removed = bindings.remove(event).map_or(0, |b| b.len());
            self.inner.dispatcher.unsubscribe_all(event);
            if removed > 0 {
                tracing::debug!(event, removed, "Unbound all listeners");
            }
            return removed;
        };

        let Some(per_event) = bindings.get_mut(event) else {
            return 0;
        };
        let id = callback.id();
        let Some(count) = per_event.get_mut(&id) else {
            return 0;
        };

        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            per_event.remove(&id);
            if per_event.is_empty() {
                bindings.remove(event);
            }
            self.inner.dispatcher.unsubscribe(event, id);
            tracing::debug!(event, "Unbound listener");
        }
        remaining
    }

    /// Logical references held on `(event, callback)`
    #[must_use]
    pub fn ref_count(&self, event: &str, callback: &Callback) -> usize {
        self.inner
            .bindings
            .lock()
            .get(event)
            .and_then(|b| b.get(&callback.id()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct `(event, callback)` bindings
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.lock().values().map(HashMap::len).sum()
    }

    /// The underlying subscription table
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Create a new owner scope
    #[must_use]
    pub fn owner(&self) -> ListenerOwner {
        ListenerOwner {
            id: Uuid::new_v4(),
            registry: self.clone(),
            pairs: Mutex::new(HashMap::new()),
        }
    }
}

/// One consumer's share of the registry
///
/// Holds at most one reference per `(event, callback)` pair: repeated `on`
/// for a pair it already holds changes nothing. Dropping the owner releases
/// everything it still holds.
pub struct ListenerOwner {
    id: Uuid,
    registry: ListenerRegistry,
    pairs: Mutex<HashMap<(String, CallbackId), Callback>>,
}

impl ListenerOwner {
    /// Owner identifier (for logs)
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Take a reference on `(event, callback)`
    ///
    /// Returns `false` if this owner already held the pair.
    pub fn on(&self, event: &str, callback: &Callback) -> bool {
        let mut pairs = self.pairs.lock();
        let key = (event.to_string(), callback.id());
        if pairs.contains_key(&key) {
            return false;
        }
        self.registry.on(event, callback);
        pairs.insert(key, callback.clone());
        true
    }

    /// Release this owner's reference on `(event, callback)`
    ///
    /// Returns `false` if the owner did not hold the pair.
    pub fn off(&self, event: &str, callback: &Callback) -> bool {
        let removed = self
            .pairs
            .lock()
            .remove(&(event.to_string(), callback.id()));
        match removed {
            Some(callback) => {
                self.registry.off(event, Some(&callback));
                true
            }
            None => false,
        }
    }

    /// Number of pairs this owner holds
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.lock().len()
    }

    /// Whether this owner holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.lock().is_empty()
    }

    /// Release every pair this owner holds, once each
    ///
    /// Returns how many pairs were released.
    pub fn cleanup(&self) -> usize {
        let drained: Vec<_> = self.pairs.lock().drain().collect();
        for ((event, _), callback) in &drained {
            self.registry.off(event, Some(callback));
        }
        if !drained.is_empty() {
            tracing::debug!(owner = %self.id, released = drained.len(), "Owner listeners released");
        }
        drained.len()
    }
}

impl Drop for ListenerOwner {
    fn drop(&mut self) {
        self.cleanup();
    }
}
