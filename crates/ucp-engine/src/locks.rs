//! Keyed async locks.
//!
//! One mutex per key (session id, SKU, token id, idempotency key), created on
//! first use. Operations on different keys never contend; operations on the
//! same key are serialized across `.await` points.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone)]
pub struct KeyedLocks {
    name: &'static str,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of a critical section on one key
pub type KeyGuard = OwnedMutexGuard<()>;

impl KeyedLocks {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> KeyGuard {
        // Clone the Arc out so the DashMap shard guard is released before awaiting
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop mutexes nobody holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        // Holders and waiters each own a clone of the Arc
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            tracing::debug!(locks = self.name, removed, "pruned idle keyed locks");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
