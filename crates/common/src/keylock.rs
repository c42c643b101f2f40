//! Per-key async mutual exclusion.
//!
//! Operations on the same key serialize; operations on different keys never
//! touch the same mutex. Lock entries are created on demand and reclaimed by
//! [`KeyLocks::prune`].

use std::sync::Arc;

use {
    dashmap::DashMap,
    tokio::sync::{Mutex, OwnedMutexGuard},
};

#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of a per-key critical section.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        // Clone the Arc out so the shard lock is released before awaiting.
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            key: key.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Non-blocking variant; `None` when another task holds the key.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.try_lock_owned().ok().map(|guard| KeyGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
