//! Bounded file-descriptor pool and the pooled file Rab.
//!
//! The pool caps the number of concurrently open OS channels across all
//! pooled buffers. Entries whose channel is open but unlocked sit in an
//! LRU set of *closables*; when the cap is hit, the least-recently-used
//! closable is evicted. An entry with a positive lock level is never
//! evicted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use lru::LruCache;
use tracing::trace;

use crate::error::{IoContext, StorageError};
use crate::rab::{RabLock, RandomAccessBuffer, check_range};
use crate::rab::file::delete_file;
use crate::resume::{ResumeContext, codec, magic};

/// Shared pool of open file channels.
///
/// Invariant: `total_open <= max_open`, or every open entry is locked.
pub struct FdPool {
    max_open: usize,
    state: Mutex<PoolCore>,
    cond: Condvar,
    next_id: AtomicU64,
}

struct PoolCore {
    total_open: usize,
    closables: LruCache<u64, Arc<PooledEntry>>,
}

struct PooledEntry {
    id: u64,
    path: PathBuf,
    read_only: bool,
    length: u64,
    persistent_id: i64,
    delete_on_dispose: bool,
    secure_delete: AtomicBool,
    state: Mutex<EntryState>,
}

#[derive(Default)]
struct EntryState {
    channel: Option<Arc<File>>,
    writable: bool,
    lock_level: u32,
    closed: bool,
}

impl FdPool {
    #[must_use]
    pub fn new(max_open: usize) -> Arc<Self> {
        assert!(max_open > 0, "pool must allow at least one open file");
        Arc::new(FdPool {
            max_open,
            state: Mutex::new(PoolCore {
                total_open: 0,
                closables: LruCache::unbounded(),
            }),
            cond: Condvar::new(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Number of currently open channels.
    #[must_use]
    pub fn total_open(&self) -> usize {
        self.state.lock().expect("lock poisoned").total_open
    }

    /// Open the entry's channel (or reuse it), bump its lock level, and
    /// return the channel plus a scoped lock. Blocks while the pool is at
    /// capacity with no evictable entry.
    fn lock_entry(
        self: &Arc<Self>,
        entry: &Arc<PooledEntry>,
        force_write: bool,
    ) -> Result<(Arc<File>, RabLock), StorageError> {
        let mut core = self.state.lock().expect("lock poisoned");
        loop {
            let mut es = entry.state.lock().expect("lock poisoned");
            if es.closed {
                return Err(StorageError::Closed);
            }
            // A locked entry must never be evictable.
            core.closables.pop(&entry.id);

            if let Some(channel) = es.channel.clone() {
                if force_write && !es.writable {
                    // Reopen the channel read-write in place.
                    match open_channel(&entry.path, false) {
                        Ok(file) => {
                            let file = Arc::new(file);
                            es.channel = Some(Arc::clone(&file));
                            es.writable = true;
                            es.lock_level += 1;
                            return Ok((file, self.make_lock(entry)));
                        }
                        Err(e) => {
                            if es.lock_level == 0 {
                                es.channel = None;
                                core.total_open -= 1;
                                self.cond.notify_all();
                            }
                            return Err(StorageError::io(
                                e,
                                IoContext::new("reopen").with_path(&entry.path),
                            ));
                        }
                    }
                }
                es.lock_level += 1;
                return Ok((channel, self.make_lock(entry)));
            }

            if core.total_open < self.max_open {
                let read_only = entry.read_only && !force_write;
                match open_channel(&entry.path, read_only) {
                    Ok(file) => {
                        let file = Arc::new(file);
                        es.channel = Some(Arc::clone(&file));
                        es.writable = !read_only;
                        es.lock_level = 1;
                        core.total_open += 1;
                        trace!(path = %entry.path.display(), total_open = core.total_open, "opened channel");
                        return Ok((file, self.make_lock(entry)));
                    }
                    // Counters untouched on a failed open.
                    Err(e) => {
                        return Err(StorageError::io(
                            e,
                            IoContext::new("open").with_path(&entry.path),
                        ));
                    }
                }
            }

            drop(es);
            if let Some((_, victim)) = core.closables.pop_lru() {
                let mut vs = victim.state.lock().expect("lock poisoned");
                debug_assert_eq!(vs.lock_level, 0, "closable entry was locked");
                vs.channel = None;
                core.total_open -= 1;
                trace!(path = %victim.path.display(), "evicted LRU channel");
                continue;
            }
            // Everything open is locked; wait for an unlock.
            core = self.cond.wait(core).expect("lock poisoned");
        }
    }

    fn make_lock(self: &Arc<Self>, entry: &Arc<PooledEntry>) -> RabLock {
        let pool = Arc::clone(self);
        let entry = Arc::clone(entry);
        RabLock::new(move || pool.unlock_entry(&entry))
    }

    fn unlock_entry(&self, entry: &Arc<PooledEntry>) {
        let mut core = self.state.lock().expect("lock poisoned");
        let mut es = entry.state.lock().expect("lock poisoned");
        es.lock_level -= 1;
        if es.lock_level == 0 && es.channel.is_some() && !es.closed {
            core.closables.put(entry.id, Arc::clone(entry));
            self.cond.notify_all();
        }
    }

    fn close_entry(&self, entry: &Arc<PooledEntry>) {
        let mut core = self.state.lock().expect("lock poisoned");
        let mut es = entry.state.lock().expect("lock poisoned");
        if es.closed {
            return;
        }
        debug_assert_eq!(es.lock_level, 0, "close with outstanding locks");
        core.closables.pop(&entry.id);
        if es.channel.take().is_some() {
            core.total_open -= 1;
            self.cond.notify_all();
        }
        es.closed = true;
    }
}

fn open_channel(path: &Path, read_only: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(path)
}

/// A Rab whose file channel is managed by an [`FdPool`]. The channel may be
/// closed between operations and is transparently reopened on demand.
pub struct PooledFileRab {
    pool: Arc<FdPool>,
    entry: Arc<PooledEntry>,
    disposed: AtomicBool,
}

impl PooledFileRab {
    /// Create (or truncate) `path` at exactly `size` bytes. The file is
    /// deleted on dispose. `persistent_id` is the filename generator's ID
    /// for this file, or `-1` for anonymous files.
    pub fn create(
        pool: &Arc<FdPool>,
        path: impl Into<PathBuf>,
        size: u64,
        persistent_id: i64,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io(e, IoContext::new("create").with_path(&path)))?;
        file.set_len(size)
            .map_err(|e| StorageError::io(e, IoContext::new("truncate").with_path(&path)))?;
        drop(file);
        Ok(Self::assemble(pool, path, size, false, persistent_id, true, false))
    }

    /// Open an existing file; the logical size is the file length.
    pub fn open(
        pool: &Arc<FdPool>,
        path: impl Into<PathBuf>,
        read_only: bool,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let length = fs::metadata(&path)
            .map_err(|e| StorageError::io(e, IoContext::new("stat").with_path(&path)))?
            .len();
        Ok(Self::assemble(pool, path, length, read_only, -1, false, false))
    }

    fn assemble(
        pool: &Arc<FdPool>,
        path: PathBuf,
        length: u64,
        read_only: bool,
        persistent_id: i64,
        delete_on_dispose: bool,
        secure_delete: bool,
    ) -> Self {
        let entry = Arc::new(PooledEntry {
            id: pool.next_id.fetch_add(1, Ordering::Relaxed),
            path,
            read_only,
            length,
            persistent_id,
            delete_on_dispose,
            secure_delete: AtomicBool::new(secure_delete),
            state: Mutex::new(EntryState::default()),
        });
        PooledFileRab {
            pool: Arc::clone(pool),
            entry,
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_secure_delete(self, secure: bool) -> Self {
        self.entry.secure_delete.store(secure, Ordering::Relaxed);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.entry.path
    }

    /// Whether the channel is currently open. Test introspection.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.entry.state.lock().expect("lock poisoned").channel.is_some()
    }

    /// Whether the channel is currently locked open. Test introspection.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.entry.state.lock().expect("lock poisoned").lock_level > 0
    }

    pub(crate) fn restore(
        reader: &mut dyn io::Read,
        ctx: &ResumeContext,
    ) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::POOLED_FILE_RAB_VERSION, "pooled file buffer")?;
        let flags = codec::read_u8(reader)?;
        let length = codec::read_u64(reader)?;
        let persistent_id = codec::read_i64(reader)?;
        let stored_path = codec::read_path(reader)?;

        // Persistent temp files follow the generator's directory, which may
        // have moved since the record was written.
        let path = if persistent_id >= 0 {
            ctx.filename_generator()
                .maybe_move(&stored_path, persistent_id)
                .map_err(|e| StorageError::ResumeFailed {
                    reason: format!("cannot relocate {}: {e}", stored_path.display()),
                })?
        } else {
            stored_path
        };

        Ok(Self::assemble(
            ctx.pool(),
            path,
            length,
            flags & 0b001 != 0,
            persistent_id,
            flags & 0b010 != 0,
            flags & 0b100 != 0,
        ))
    }

    fn check_live(&self) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::AlreadyFreed);
        }
        Ok(())
    }
}

impl RandomAccessBuffer for PooledFileRab {
    fn size(&self) -> u64 {
        self.entry.length
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_live()?;
        check_range(offset, buf.len(), self.entry.length)?;
        let (file, lock) = self.pool.lock_entry(&self.entry, false)?;
        let result = file.read_exact_at(buf, offset).map_err(|e| {
            StorageError::io(
                e,
                IoContext::new("pread")
                    .with_path(&self.entry.path)
                    .with_offset(offset)
                    .with_len(buf.len() as u64),
            )
        });
        lock.unlock();
        result
    }

    fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        self.check_live()?;
        if self.entry.read_only {
            return Err(StorageError::ReadOnly);
        }
        check_range(offset, buf.len(), self.entry.length)?;
        let (file, lock) = self.pool.lock_entry(&self.entry, true)?;
        let result = file.write_all_at(buf, offset).map_err(|e| {
            StorageError::io(
                e,
                IoContext::new("pwrite")
                    .with_path(&self.entry.path)
                    .with_offset(offset)
                    .with_len(buf.len() as u64),
            )
        });
        lock.unlock();
        result
    }

    fn close(&self) {
        self.pool.close_entry(&self.entry);
    }

    fn dispose(&self) {
        self.close();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.entry.delete_on_dispose {
            delete_file(
                &self.entry.path,
                self.entry.length,
                self.entry.secure_delete.load(Ordering::Relaxed),
            );
        }
    }

    fn lock_open(&self) -> Result<RabLock, StorageError> {
        self.check_live()?;
        let (_, lock) = self.pool.lock_entry(&self.entry, false)?;
        Ok(lock)
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        self.check_live()?;
        codec::write_u32(sink, magic::POOLED_FILE_RAB)?;
        codec::write_u32(sink, magic::POOLED_FILE_RAB_VERSION)?;
        let flags = u8::from(self.entry.read_only)
            | u8::from(self.entry.delete_on_dispose) << 1
            | u8::from(self.entry.secure_delete.load(Ordering::Relaxed)) << 2;
        codec::write_u8(sink, flags)?;
        codec::write_u64(sink, self.entry.length)?;
        codec::write_i64(sink, self.entry.persistent_id)?;
        codec::write_path(sink, &self.entry.path)?;
        Ok(())
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        let len = fs::metadata(&self.entry.path)
            .map_err(|e| StorageError::ResumeFailed {
                reason: format!("file {} missing: {e}", self.entry.path.display()),
            })?
            .len();
        if len != self.entry.length {
            return Err(StorageError::ResumeFailed {
                reason: format!(
                    "file {} has length {len}, expected {}",
                    self.entry.path.display(),
                    self.entry.length
                ),
            });
        }
        ctx.tracker().register(&self.entry.path);
        Ok(())
    }
}

impl Drop for PooledFileRab {
    fn drop(&mut self) {
        // Last-resort: a leaked pooled Rab must not pin a pool slot.
        if !self.disposed.load(Ordering::Acquire) {
            let es = self.entry.state.lock().expect("lock poisoned");
            let locked = es.lock_level > 0;
            drop(es);
            if !locked {
                self.pool.close_entry(&self.entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn make(pool: &Arc<FdPool>, dir: &TempDir, name: &str, size: u64) -> PooledFileRab {
        PooledFileRab::create(pool, dir.path().join(name), size, -1).unwrap()
    }

    #[test]
    fn pool_bound_is_respected() {
        let dir = TempDir::new().unwrap();
        let pool = FdPool::new(1);
        let a = make(&pool, &dir, "a", 1024);
        let b = make(&pool, &dir, "b", 1024);

        a.pwrite(0, b"aaaa").unwrap();
        assert!(pool.total_open() <= 1);
        b.pwrite(0, b"bbbb").unwrap();
        assert!(pool.total_open() <= 1);

        let mut buf = [0u8; 4];
        a.pread(0, &mut buf).unwrap();
        assert_eq!(&buf, b"aaaa");
        assert!(pool.total_open() <= 1);
    }

    #[test]
    fn lru_evicts_oldest_unlocked() {
        let dir = TempDir::new().unwrap();
        let pool = FdPool::new(1);
        let a = make(&pool, &dir, "a", 16);
        let b = make(&pool, &dir, "b", 16);

        a.lock_open().unwrap().unlock();
        assert!(a.is_open());

        // The pool is full; opening b must close a, the only closable.
        b.lock_open().unwrap().unlock();
        assert!(!a.is_open());
        assert!(b.is_open());
        assert_eq!(pool.total_open(), 1);
    }

    #[test]
    fn locked_entry_blocks_waiter_until_unlock() {
        let dir = TempDir::new().unwrap();
        let pool = FdPool::new(1);
        let p = make(&pool, &dir, "p", 16);
        let q = Arc::new(make(&pool, &dir, "q", 16));

        let lock = p.lock_open().unwrap();
        assert!(p.is_locked());
        assert_eq!(pool.total_open(), 1);

        let (tx, rx) = mpsc::channel();
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || {
            let lock = q2.lock_open().unwrap();
            tx.send(()).unwrap();
            lock.unlock();
        });

        // The second thread must be stuck while p holds the only slot.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        lock.unlock();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(pool.total_open(), 1);
    }

    #[test]
    fn close_requires_no_locks_and_frees_slot() {
        let dir = TempDir::new().unwrap();
        let pool = FdPool::new(2);
        let a = make(&pool, &dir, "a", 16);
        a.lock_open().unwrap().unlock();
        assert_eq!(pool.total_open(), 1);
        a.close();
        assert_eq!(pool.total_open(), 0);
        assert!(matches!(a.pread(0, &mut [0u8; 1]), Err(StorageError::Closed)));
    }

    #[test]
    fn dispose_deletes_backing() {
        let dir = TempDir::new().unwrap();
        let pool = FdPool::new(2);
        let a = make(&pool, &dir, "a", 16);
        let path = a.path().to_path_buf();
        a.pwrite(0, &[7u8; 16]).unwrap();
        a.dispose();
        assert!(!path.exists());
        assert!(matches!(
            a.pread(0, &mut [0u8; 1]),
            Err(StorageError::AlreadyFreed)
        ));
    }

    #[test]
    fn read_only_rab_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let pool = FdPool::new(2);
        let path = dir.path().join("ro");
        fs::write(&path, b"0123456789").unwrap();
        let ro = PooledFileRab::open(&pool, &path, true).unwrap();
        assert_eq!(ro.size(), 10);
        assert!(matches!(ro.pwrite(0, &[1]), Err(StorageError::ReadOnly)));
        let mut buf = [0u8; 2];
        ro.pread(8, &mut buf).unwrap();
        assert_eq!(&buf, b"89");
    }
}
