//! Named asynchronous locks.
//!
//! A [`LockRegistry`] hands out one exclusive lock per name. Waiters for the
//! same name are served in request order; different names never contend.
//! Entries are created on first use and dropped when the last holder or
//! waiter goes away, so the registry does not grow with the set of names
//! ever locked.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Registry of named locks. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct LockRegistry {
    slots: Slots,
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("held", &self.slots.lock().len())
            .finish()
    }
}

impl LockRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the lock named `name`. The lock is released when the guard
    /// is dropped.
    pub async fn acquire(&self, name: impl Into<String>) -> LockGuard {
        let name = name.into();
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(name.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        trace!(lock = %name, "acquire");
        let guard = slot.lock_owned().await;
        LockGuard {
            name,
            slots: Arc::clone(&self.slots),
            guard: Some(guard),
        }
    }

    /// Returns true if someone holds or waits for `name`.
    #[must_use]
    pub fn is_locked(&self, name: &str) -> bool {
        self.slots
            .lock()
            .get(name)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of names currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns true if no lock is held or awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a named lock until dropped.
pub struct LockGuard {
    name: String,
    slots: Slots,
    guard: Option<OwnedMutexGuard<()>>,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

impl LockGuard {
    /// Name of the held lock.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock();
        // registry map + nobody else holding a clone means no waiters
        if slots
            .get(&self.name)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.name);
        }
        trace!(lock = %self.name, "release");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_name_is_exclusive_and_fifo() {
        let locks = LockRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.acquire("source:a").await;
        assert!(locks.is_locked("source:a"));

        let mut handles = Vec::new();
        for i in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("source:a").await;
                order.lock().push(i);
            }));
            // let each waiter enqueue before the next
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(order.lock().is_empty());
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let locks = LockRegistry::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn released_on_early_return() {
        async fn fails(locks: &LockRegistry) -> Result<(), &'static str> {
            let _guard = locks.acquire("x").await;
            Err("boom")
        }
        let locks = LockRegistry::new();
        assert!(fails(&locks).await.is_err());
        assert!(!locks.is_locked("x"));
        assert!(locks.is_empty());
    }
}
