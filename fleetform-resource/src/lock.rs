use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use fleetform_core::ResourceIdentifier;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Single-flight locks for mutating operations, one per resource identifier.
///
/// Cloning the table shares the locks. Reconcilers for the same identifier
/// must share a table for the locks to mean anything; the
/// [`ReconcilerFactory`](crate::ReconcilerFactory) takes care of that.
#[derive(Clone, Default)]
pub struct LockTable {
    locks: Arc<Mutex<HashMap<ResourceIdentifier, Arc<AsyncMutex<()>>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other mutation of `id` is in progress.
    pub async fn lock(&self, id: &ResourceIdentifier) -> OwnedMutexGuard<()> {
        self.entry(id).lock_owned().await
    }

    /// Lock `id` if no other mutation of it is in progress.
    pub fn try_lock(&self, id: &ResourceIdentifier) -> Option<OwnedMutexGuard<()>> {
        self.entry(id).try_lock_owned().ok()
    }

    fn entry(&self, id: &ResourceIdentifier) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        // Entries referenced only by the table are unlocked and unwaited.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(id.clone()).or_default().clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}
