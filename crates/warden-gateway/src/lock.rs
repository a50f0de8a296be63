//! Per-key serialization of state-mutating gateway calls.
//!
//! Calls on the same `(principal, secret)` pair run one at a time; different
//! pairs proceed in parallel. Idle entries are pruned by the reaper.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock identity: `(principal, secret_id)`, kept as two fields so no id
/// content can make two pairs collide.
pub type LockKey = (String, String);

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`. The guard releases it on drop.
    pub async fn lock(&self, key: LockKey) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(&self.locks.entry(key).or_default());
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on. Returns the number removed.
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

pub(crate) fn lock_key(principal: &str, secret_id: &str) -> LockKey {
    (principal.to_string(), secret_id.to_string())
}
