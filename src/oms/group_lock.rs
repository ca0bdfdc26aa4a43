//! Per-group async lock registry backing the "caller holds the group-scoped
//! lock" contract on [`crate::oms::position_manager::PositionManager::update_position_stats`]
//! (spec §5). Shared between `FillMonitor`'s fill-reconciliation cycle and
//! `RiskEngine`'s offset execution so the two never interleave their
//! read-compute-write sequence against the same position group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct GroupLocks {
    inner: Arc<StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `group_id`, creating its entry on first use.
    /// Hold the returned guard for the full span of a read-compute-write
    /// sequence against that group; the registry entry is never removed, so
    /// repeated calls for the same id always serialize against each other.
    pub async fn lock(&self, group_id: Uuid) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().expect("group lock registry poisoned");
            Arc::clone(map.entry(group_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
        };
        entry.lock_owned().await
    }
}
