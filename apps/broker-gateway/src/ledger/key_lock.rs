//! Per-key async locks.
//!
//! Writers for the same idempotency key are serialized; unrelated keys never
//! contend. Entries whose lock is no longer held or awaited are pruned.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Table of per-key locks.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

/// Exclusive hold on one key. Released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    /// Locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyLocks {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut locks = self.locks.lock();
            locks.retain(|_, weak| weak.strong_count() > 0);

            if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
                existing
            } else {
                let fresh = Arc::new(AsyncMutex::new(()));
                locks.insert(key.to_string(), Arc::downgrade(&fresh));
                fresh
            }
        };

        KeyGuard {
            key: key.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Keys currently held or awaited.
    #[must_use]
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
