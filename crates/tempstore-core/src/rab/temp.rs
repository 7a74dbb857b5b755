//! Switchable-proxy temp Rab: one handle whose backing can be swapped from
//! RAM to disk atomically.
//!
//! Reads and writes take the read side of the proxy lock and delegate to
//! the current backing; migration takes the write side, so it is a
//! linearization point: every operation before it sees the old backing,
//! every operation after sees the new one.

use std::io::Write;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::rab::{ArrayRab, RabFactory, RabLock, RandomAccessBuffer, copy_rab};
use crate::resume::ResumeContext;
use crate::temp::tracker::{TempRamTracker, TempStorage};

/// Public handle; the shared state is what the RAM tracker watches.
pub struct TempRab {
    shared: Arc<TempRabShared>,
}

pub(crate) struct TempRabShared {
    size: u64,
    created: Instant,
    factory: Arc<dyn RabFactory>,
    tracker: Arc<TempRamTracker>,
    state: RwLock<TempRabState>,
    disposed: AtomicBool,
}

struct TempRabState {
    inner: Box<dyn RandomAccessBuffer>,
    ram: bool,
    held: Vec<RabLock>,
}

impl TempRab {
    /// A RAM-backed temp Rab of `size` bytes, accounted against `tracker`.
    /// `factory` supplies the on-disk successor at migration time.
    #[must_use]
    pub fn new_ram(size: u64, factory: Arc<dyn RabFactory>, tracker: Arc<TempRamTracker>) -> Self {
        let backing = ArrayRab::new(usize::try_from(size).expect("RAM size fits usize"));
        tracker.add(size);
        let shared = Arc::new(TempRabShared {
            size,
            created: Instant::now(),
            factory,
            tracker,
            state: RwLock::new(TempRabState {
                inner: Box::new(backing),
                ram: true,
                held: Vec::new(),
            }),
            disposed: AtomicBool::new(false),
        });
        shared
            .tracker
            .register(Arc::downgrade(&shared) as std::sync::Weak<dyn TempStorage>);
        TempRab { shared }
    }

    /// Adopt an already-populated RAM backing (used when converting a RAM
    /// temp bucket into a Rab without losing pool accounting). Charges the
    /// backing's size to the tracker; the caller releases whatever it had
    /// accounted before.
    #[must_use]
    pub(crate) fn adopt_ram(
        backing: ArrayRab,
        factory: Arc<dyn RabFactory>,
        tracker: Arc<TempRamTracker>,
        created: Instant,
    ) -> Self {
        let size = backing.size();
        tracker.add(size);
        let shared = Arc::new(TempRabShared {
            size,
            created,
            factory,
            tracker,
            state: RwLock::new(TempRabState {
                inner: Box::new(backing),
                ram: true,
                held: Vec::new(),
            }),
            disposed: AtomicBool::new(false),
        });
        shared
            .tracker
            .register(Arc::downgrade(&shared) as std::sync::Weak<dyn TempStorage>);
        TempRab { shared }
    }

    /// Whether the backing currently lives in RAM. Test introspection.
    #[must_use]
    pub fn is_ram(&self) -> bool {
        self.shared.state.read().expect("lock poisoned").ram
    }

    /// Migrate the backing to disk. Returns `false` if already on disk.
    pub fn migrate_to_disk(&self) -> Result<bool, StorageError> {
        self.shared.migrate_to_disk()
    }
}

impl TempRabShared {
    fn check_live(&self) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::AlreadyFreed);
        }
        Ok(())
    }
}

impl TempStorage for TempRabShared {
    fn created(&self) -> Instant {
        self.created
    }

    fn is_ram(&self) -> bool {
        self.state.read().expect("lock poisoned").ram
    }

    fn ram_bytes(&self) -> u64 {
        if self.is_ram() { self.size } else { 0 }
    }

    #[instrument(level = "debug", skip(self), fields(size = self.size))]
    fn migrate_to_disk(&self) -> Result<bool, StorageError> {
        let mut state = self.state.write().expect("lock poisoned");
        self.check_live()?;
        if !state.ram {
            return Ok(false);
        }

        let successor = self.factory.make_rab(self.size)?;
        if let Err(e) = copy_rab(&*state.inner, &*successor, self.size) {
            successor.dispose();
            return Err(e);
        }

        // Transfer outstanding locks before the swap so the "keep open"
        // right never lapses.
        let mut transferred = Vec::with_capacity(state.held.len());
        for _ in 0..state.held.len() {
            match successor.lock_open() {
                Ok(lock) => transferred.push(lock),
                Err(e) => {
                    drop(transferred);
                    successor.dispose();
                    return Err(e);
                }
            }
        }

        let old = mem::replace(&mut state.inner, successor);
        state.held = transferred;
        state.ram = false;
        drop(state);

        old.dispose();
        self.tracker.sub(self.size);
        debug!("temp Rab migrated to disk");
        Ok(true)
    }
}

impl RandomAccessBuffer for TempRab {
    fn size(&self) -> u64 {
        self.shared.size
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let state = self.shared.state.read().expect("lock poisoned");
        self.shared.check_live()?;
        state.inner.pread(offset, buf)
    }

    fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        let state = self.shared.state.read().expect("lock poisoned");
        self.shared.check_live()?;
        state.inner.pwrite(offset, buf)
    }

    fn close(&self) {
        let state = self.shared.state.read().expect("lock poisoned");
        state.inner.close();
    }

    fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.shared.state.write().expect("lock poisoned");
        state.held.clear();
        state.inner.dispose();
        if state.ram {
            self.shared.tracker.sub(self.shared.size);
            state.ram = false;
        }
    }

    fn lock_open(&self) -> Result<RabLock, StorageError> {
        let mut state = self.shared.state.write().expect("lock poisoned");
        self.shared.check_live()?;
        let lock = state.inner.lock_open()?;
        state.held.push(lock);
        drop(state);

        let shared = Arc::clone(&self.shared);
        Ok(RabLock::new(move || {
            // All transferred locks are interchangeable; release any one.
            shared.state.write().expect("lock poisoned").held.pop();
        }))
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        // RAM contents cannot outlive the process; persist via the disk
        // backing's own record.
        self.shared.check_live()?;
        self.shared.migrate_to_disk()?;
        let state = self.shared.state.read().expect("lock poisoned");
        state.inner.store_to(sink)
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        let state = self.shared.state.read().expect("lock poisoned");
        state.inner.on_resume(ctx)
    }
}

impl Drop for TempRab {
    fn drop(&mut self) {
        // Last-resort guard for handles dropped without an explicit
        // dispose; RAM accounting must not leak.
        if !self.shared.disposed.load(Ordering::Acquire) {
            self.dispose();
        }
    }
}
