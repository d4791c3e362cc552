//! Per-key exclusive locks
//!
//! Single writer per key: every read-modify-write of a packet (claim, sweep,
//! reconciliation) holds that packet's lock for the whole cycle, so the
//! RocksDB commit that ends the cycle is linearizable per packet while
//! different packets proceed in parallel.
//!
//! Lock waits are bounded; a timed out wait is reported as
//! [`Error::TransientStore`] and handled by the retry policy.

use crate::{Error, Result};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of lazily created async mutexes keyed by `K`
pub struct KeyLocks<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl<K: Eq + Hash + Clone> KeyLocks<K> {
    /// Create a table whose waits give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Acquire the lock for `key`
    pub async fn acquire(&self, key: K) -> Result<KeyGuard<'_, K>> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(KeyGuard {
                locks: &self.locks,
                key,
                guard: Some(guard),
            }),
            Err(_) => {
                self.release_idle(&key);
                Err(Error::TransientStore(format!(
                    "lock wait exceeded {} ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    /// Number of keys with a live mutex
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check whether no key is locked or awaited
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    // Only the map's own reference left: nobody holds or waits on it.
    fn release_idle(&self, key: &K) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Held lock; released on drop
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
