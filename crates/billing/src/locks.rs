//! Per-subscriber serialization
//!
//! Ingestion and reconciliation take the same lock before their read-modify-write
//! on a subscriber's sync state. Locks are held weakly: once every guard for a
//! subscriber is dropped the entry is dead, and dead entries are swept once
//! the table doubles in size since the last sweep.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Guard for one subscriber; the lock is released on drop
pub type SubscriberGuard = OwnedMutexGuard<()>;

/// Table size below which dead entries are left in place
const PRUNE_FLOOR: usize = 64;

#[derive(Debug)]
struct LockTable {
    locks: HashMap<String, Weak<Mutex<()>>>,
    prune_at: usize,
}

impl Default for LockTable {
    fn default() -> Self {
        Self {
            locks: HashMap::new(),
            prune_at: PRUNE_FLOOR,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SubscriberLocks {
    inner: Arc<Mutex<LockTable>>,
}

impl SubscriberLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `subscriber_id`
    pub async fn lock(&self, subscriber_id: &str) -> SubscriberGuard {
        let lock = {
            let mut table = self.inner.lock().await;
            if table.locks.len() >= table.prune_at {
                table.locks.retain(|_, weak| weak.strong_count() > 0);
                table.prune_at = (table.locks.len() * 2).max(PRUNE_FLOOR);
            }

            match table.locks.get(subscriber_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    table
                        .locks
                        .insert(subscriber_id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };

        lock.lock_owned().await
    }

    /// Number of subscribers with a live lock
    pub async fn active(&self) -> usize {
        self.inner
            .lock()
            .await
            .locks
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
