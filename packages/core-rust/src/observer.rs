//! Generic observer.
//!
//! [`Observable<T>`] fans one event out to every registered listener. It is
//! the single listener/emitter used for every event kind in the hub
//! (connection changes, relay drain notifications, ...), parameterized over
//! the payload type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Handle returned on subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: ListenerId,
    once: bool,
    listener: Listener<T>,
}

/// A list of listeners for events of type `T`.
///
/// Listeners are invoked in subscription order, outside the internal lock,
/// so a listener may subscribe or unsubscribe (itself or others) while it
/// runs.
pub struct Observable<T> {
    entries: RwLock<Vec<Entry<T>>>,
    next_id: AtomicU64,
}

impl<T> Observable<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a listener fired on every emit.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.push(false, Arc::new(listener))
    }

    /// Adds a listener removed after its first invocation.
    pub fn subscribe_once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.push(true, Arc::new(listener))
    }

    fn push(&self, once: bool, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push(Entry { id, once, listener });
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Delivers `event` to all listeners, returning how many were invoked.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot: Vec<Listener<T>> = {
            let mut entries = self.entries.write();
            let snapshot = entries.iter().map(|e| Arc::clone(&e.listener)).collect();
            entries.retain(|e| !e.once);
            snapshot
        };
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("listeners", &self.len())
            .finish()
    }
}
