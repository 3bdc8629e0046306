//! Per-object async locks.
//!
//! Promote and delete on one canonical blob location must never interleave.
//! Each blob id maps to a `tokio::sync::Mutex` that callers hold across the
//! whole promote/index (or delete/index) sequence. The registry only keeps
//! weak references, so a key with no guard alive costs nothing once pruned.

use crate::models::object::BlobId;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const MIN_PRUNE_AT: usize = 64;

struct Slots {
    by_id: HashMap<BlobId, Weak<AsyncMutex<()>>>,
    prune_at: usize,
}

pub struct KeyLocks {
    slots: Mutex<Slots>,
}

/// Exclusive access to one blob id until dropped.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Slots {
                by_id: HashMap::new(),
                prune_at: MIN_PRUNE_AT,
            }),
        }
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: &BlobId) -> KeyGuard {
        let mutex = self.slot(id);
        KeyGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    fn slot(&self, id: &BlobId) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.by_id.get(id).and_then(Weak::upgrade) {
            return existing;
        }

        let mutex = Arc::new(AsyncMutex::new(()));
        slots.by_id.insert(id.clone(), Arc::downgrade(&mutex));
        if slots.by_id.len() >= slots.prune_at {
            slots.by_id.retain(|_, weak| weak.strong_count() > 0);
            slots.prune_at = (slots.by_id.len() * 2).max(MIN_PRUNE_AT);
        }
        mutex
    }

    /// Number of ids with a live lock.
    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .by_id
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let id = BlobId::for_object("b", "k");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    let _guard = locks.lock(&id).await;
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&BlobId::for_object("b", "a")).await;
        let b = tokio::time::timeout(
            Duration::from_secs(1),
            locks.lock(&BlobId::for_object("b", "c")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn released_locks_are_reclaimed() {
        let locks = KeyLocks::new();
        for n in 0..(MIN_PRUNE_AT * 3) {
            let _guard = locks.lock(&BlobId::for_object("b", &n.to_string())).await;
        }
        assert_eq!(locks.active(), 0);
        assert!(locks.slots.lock().by_id.len() < MIN_PRUNE_AT * 3);
    }
}
