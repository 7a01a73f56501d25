mod replicated;
mod session;
mod snapshot;

pub use replicated::{ReplicatedStore, StateListener, SNAPSHOT_KEY};
pub use session::{SessionListener, SessionStateStore, SESSION_CATEGORY};
pub use snapshot::{MemorySnapshotStorage, SqliteSnapshotStorage};

use parking_lot::Mutex;
use std::sync::Arc;

/// Handle for one change-listener registration. Dropping it unsubscribes.
pub struct ChangeGuard<L> {
    id: u64,
    listeners: Arc<Mutex<Vec<(u64, L)>>>,
}

impl<L> ChangeGuard<L> {
    pub(crate) fn new(id: u64, listeners: Arc<Mutex<Vec<(u64, L)>>>) -> Self {
        Self { id, listeners }
    }

    pub fn unsubscribe(self) {}
}

impl<L> Drop for ChangeGuard<L> {
    fn drop(&mut self) {
        self.listeners.lock().retain(|(id, _)| *id != self.id);
    }
}
