use std::collections::HashMap;
use std::sync::Arc;

use raid_roster_core::RecruitmentId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per recruitment id, so transitions on the same id never interleave.
#[derive(Debug, Default)]
pub struct IdLocks {
    entries: Mutex<HashMap<RecruitmentId, Arc<Mutex<()>>>>,
}

impl IdLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. The guard is held across awaits for the whole
    /// transition.
    pub async fn acquire(&self, id: RecruitmentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub async fn prune(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - entries.len()
    }
}
