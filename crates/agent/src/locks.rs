//! Per-run serialization.

use distillery_core::run::RunId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A registry of per-run async mutexes. Steps and forced compressions of
/// the same run queue behind one lock; different runs never contend.
///
/// Entries are weak: a run's mutex lives only while a guard or a waiter
/// holds it, and dead entries are pruned on the next acquire.
#[derive(Default)]
pub struct RunLocks {
    inner: Mutex<HashMap<RunId, Weak<Mutex<()>>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, run_id: &RunId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut registry = self.inner.lock().await;
            registry.retain(|_, lock| lock.strong_count() > 0);
            match registry.get(run_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    registry.insert(run_id.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}
