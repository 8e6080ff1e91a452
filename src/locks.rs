//! Per-sandbox mutual exclusion.
//!
//! Each sandbox id maps to its own async mutex so operations on one
//! sandbox (create, delete, resize, cleanup) never interleave while
//! different sandboxes proceed in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Table of per-sandbox locks, created on demand.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `sandbox_id`, creating it if absent.
    pub async fn get_or_create(&self, sandbox_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(sandbox_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Acquires the lock for `sandbox_id`, waiting while another task holds it.
    ///
    /// The table itself is not locked while waiting.
    pub async fn acquire(&self, sandbox_id: &str) -> OwnedMutexGuard<()> {
        self.get_or_create(sandbox_id).await.lock_owned().await
    }

    /// Removes the lock for `sandbox_id` if nobody holds or waits on it.
    ///
    /// A holder or waiter keeps its own `Arc`, so a strong count of one
    /// means only the table references the lock. Returns true if removed.
    pub async fn remove_if_idle(&self, sandbox_id: &str) -> bool {
        let mut locks = self.locks.lock().await;
        let idle = locks
            .get(sandbox_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(sandbox_id);
            debug!(sandbox_id, "Removed sandbox lock");
        }
        idle
    }

    /// Ids that currently have a lock entry.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.locks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drops idle locks whose ids are not in `tracked`. Returns the removed ids.
    pub async fn audit(&self, tracked: &HashSet<String>) -> Vec<String> {
        let mut locks = self.locks.lock().await;
        let stale: Vec<String> = locks
            .iter()
            .filter(|(id, lock)| !tracked.contains(*id) && Arc::strong_count(lock) == 1)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            locks.remove(id);
        }
        stale
    }
}
