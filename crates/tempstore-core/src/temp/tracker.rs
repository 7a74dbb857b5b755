//! Accounting for RAM-backed temp storage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::error::StorageError;

/// Implemented by temp storage objects the releaser can migrate.
pub trait TempStorage: Send + Sync {
    /// Creation time, for the age policy.
    fn created(&self) -> Instant;

    /// Whether the object is currently RAM-backed.
    fn is_ram(&self) -> bool;

    /// Bytes currently accounted against the RAM pool.
    fn ram_bytes(&self) -> u64;

    /// One-shot migration to disk. Returns `false` if already migrated.
    fn migrate_to_disk(&self) -> Result<bool, StorageError>;
}

/// Tracks RAM bytes in use and the set of live temp-storage objects.
///
/// Invariant: `in_use` equals the sum of `ram_bytes()` over all live,
/// undisposed, RAM-backed temp storage.
#[derive(Default)]
pub struct TempRamTracker {
    bytes: AtomicU64,
    queue: Mutex<VecDeque<Weak<dyn TempStorage>>>,
}

impl TempRamTracker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(TempRamTracker::default())
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn sub(&self, bytes: u64) {
        let prev = self.bytes.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "RAM accounting went negative");
    }

    /// RAM bytes currently in use by live temp storage.
    #[must_use]
    pub fn in_use(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    /// Register a live temp-storage object for the releaser to find.
    pub fn register(&self, storage: Weak<dyn TempStorage>) {
        self.queue.lock().expect("lock poisoned").push_back(storage);
    }

    /// Snapshot the live, RAM-backed objects, oldest first, pruning dead
    /// entries as a side effect.
    #[must_use]
    pub fn snapshot_ram(&self) -> Vec<Arc<dyn TempStorage>> {
        let mut queue = self.queue.lock().expect("lock poisoned");
        let mut live = Vec::new();
        queue.retain(|weak| match weak.upgrade() {
            Some(storage) => {
                if storage.is_ram() {
                    live.push(storage);
                }
                true
            }
            None => false,
        });
        drop(queue);
        live.sort_by_key(|s| s.created());
        live
    }
}
