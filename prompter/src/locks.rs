//! Keyed exclusive-acquisition registries.
//!
//! Two registries back the orchestration layer: one keyed by CLI session token
//! (at most one AI call in flight per conversation) and one keyed by repository
//! identity (at most one clone/update in flight per working copy). Locks are
//! created lazily on first use and kept for the life of the process.
//!
//! Acquisition is FIFO (`tokio::sync::Mutex` is fair), so holders of one key
//! run strictly in arrival order. Distinct keys never contend.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Held lock for one key; dropping it releases the key.
pub type KeyedGuard<V = ()> = OwnedMutexGuard<V>;

/// A lazily populated map of per-key async mutexes, each guarding a `V`.
pub struct LockRegistry<K, V = ()> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<V>>>>,
}

impl<K, V> Default for LockRegistry<K, V> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> LockRegistry<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until every earlier holder of `key` has released it.
    pub async fn acquire(&self, key: &K) -> KeyedGuard<V> {
        let lock = self.lock_for(key);
        trace!(?key, "waiting for keyed lock");
        let guard = lock.lock_owned().await;
        trace!(?key, "acquired keyed lock");
        guard
    }

    fn lock_for(&self, key: &K) -> Arc<AsyncMutex<V>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }
}
