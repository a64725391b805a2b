//! Listener registry for lifecycle events.
//!
//! Components that emit events (the database, each table) own a
//! [`Listeners`] for their event type. Callbacks run synchronously on the
//! emitting flow in registration order; channel subscribers receive a clone
//! of every event and are dropped once their receiver goes away.
//!
//! ```
//! use sitedb_core::Listeners;
//!
//! let listeners: Listeners<u32> = Listeners::new();
//! let rx = listeners.subscribe();
//! listeners.emit(&7);
//! assert_eq!(rx.try_recv().unwrap(), 7);
//! ```

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Handle returned by [`Listeners::on`], used to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registered callbacks and channel subscribers for one event type.
pub struct Listeners<E> {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(ListenerId, Callback<E>)>>,
    subscribers: RwLock<Vec<Sender<E>>>,
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("callbacks", &self.callbacks.read().len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            callbacks: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl<E: Clone> Listeners<E> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback.
    pub fn on(&self, f: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, Arc::new(f)));
        id
    }

    /// Removes a callback. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(i, _)| *i != id);
        callbacks.len() != before
    }

    /// Returns a receiver for every future event.
    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Delivers an event to every callback, then every subscriber.
    pub fn emit(&self, event: &E) {
        // snapshot so callbacks may register or remove listeners
        let callbacks: Vec<Callback<E>> =
            self.callbacks.read().iter().map(|(_, f)| f.clone()).collect();
        for f in callbacks {
            f(event);
        }
        self.subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of callbacks plus live subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.read().len() + self.subscribers.read().len()
    }

    /// Returns true if nobody is listening.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
