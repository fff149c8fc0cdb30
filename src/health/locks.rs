//! Per-monitor exclusive locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock table keyed by monitor id. Evaluations for one monitor run one at a
/// time; different monitors never contend.
#[derive(Debug, Default)]
pub struct MonitorLocks {
    table: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl MonitorLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, monitor_id: i64) -> Arc<AsyncMutex<()>> {
        let mut table = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.entry(monitor_id).or_default().clone()
    }

    /// Wait for exclusive access to one monitor. Waiters are served in
    /// arrival order.
    pub async fn lock(&self, monitor_id: i64) -> OwnedMutexGuard<()> {
        self.entry(monitor_id).lock_owned().await
    }

    /// Lock several monitors, always in ascending id order.
    pub async fn lock_many(&self, monitor_ids: &[i64]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = monitor_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }

    /// Drop the entry of a deleted monitor.
    pub fn forget(&self, monitor_id: i64) {
        let mut table = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.remove(&monitor_id);
    }
}
