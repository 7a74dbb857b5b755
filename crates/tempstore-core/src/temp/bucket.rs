//! The RAM→disk temp bucket: starts life as an in-memory bucket and
//! migrates to a factory-made disk bucket when it outgrows its budget or
//! ages out.
//!
//! Streams are migration-aware: the writer's underlying sink is swapped in
//! place during migration, and readers reopen the new backing at their own
//! position on the next read. Migration itself is a one-shot transition
//! under the state write lock.

use std::io::{self, Read, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tracing::{debug, instrument};

use crate::bucket::{ArrayBucket, Bucket, BucketFactory, NullBucket};
use crate::error::{StorageError, to_io_error};
use crate::rab::{ArrayRab, RabFactory, RandomAccessBuffer, TempRab};
use crate::resume::ResumeContext;
use crate::temp::tracker::{TempRamTracker, TempStorage};

/// Public handle; the shared state is what the RAM tracker watches.
pub struct TempBucket {
    inner: Arc<TempBucketInner>,
}

pub(crate) struct TempBucketInner {
    name: String,
    bucket_factory: Arc<dyn BucketFactory>,
    rab_factory: Arc<dyn RabFactory>,
    tracker: Arc<TempRamTracker>,
    created: Instant,
    /// Ceiling a RAM-backed bucket may grow to before it must migrate.
    max_ram_size: u64,
    /// Bytes charged against the RAM pool: the admission-time request, or
    /// the high-water size if writes grew past it.
    accounted: AtomicU64,
    state: RwLock<TempBucketState>,
    /// Bumped on every migration and truncation; readers compare it to
    /// know when to reopen.
    generation: AtomicU64,
    read_only: AtomicBool,
    writer_open: AtomicBool,
    closed: AtomicBool,
    disposed: AtomicBool,
}

struct TempBucketState {
    backing: Backing,
    writer_slot: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
}

enum Backing {
    Ram(ArrayBucket),
    Disk(Box<dyn Bucket>),
}

impl Backing {
    fn as_bucket(&self) -> &dyn Bucket {
        match self {
            Backing::Ram(bucket) => bucket,
            Backing::Disk(bucket) => bucket.as_ref(),
        }
    }

    fn is_ram(&self) -> bool {
        matches!(self, Backing::Ram(_))
    }
}

impl TempBucket {
    /// A RAM-backed temp bucket charged `requested` bytes against the
    /// tracker's pool.
    #[must_use]
    pub fn new_ram(
        name: impl Into<String>,
        requested: u64,
        max_ram_size: u64,
        bucket_factory: Arc<dyn BucketFactory>,
        rab_factory: Arc<dyn RabFactory>,
        tracker: Arc<TempRamTracker>,
    ) -> Self {
        let name = name.into();
        tracker.add(requested);
        let inner = Arc::new(TempBucketInner {
            bucket_factory,
            rab_factory,
            tracker,
            created: Instant::now(),
            max_ram_size,
            accounted: AtomicU64::new(requested),
            state: RwLock::new(TempBucketState {
                backing: Backing::Ram(ArrayBucket::new(name.clone())),
                writer_slot: None,
            }),
            generation: AtomicU64::new(0),
            read_only: AtomicBool::new(false),
            writer_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            name,
        });
        inner
            .tracker
            .register(Arc::downgrade(&inner) as std::sync::Weak<dyn TempStorage>);
        TempBucket { inner }
    }

    /// A temp bucket born on disk (too large or no RAM budget left).
    #[must_use]
    pub fn new_disk(
        name: impl Into<String>,
        backing: Box<dyn Bucket>,
        bucket_factory: Arc<dyn BucketFactory>,
        rab_factory: Arc<dyn RabFactory>,
        tracker: Arc<TempRamTracker>,
    ) -> Self {
        let inner = Arc::new(TempBucketInner {
            bucket_factory,
            rab_factory,
            tracker,
            created: Instant::now(),
            max_ram_size: 0,
            accounted: AtomicU64::new(0),
            state: RwLock::new(TempBucketState {
                backing: Backing::Disk(backing),
                writer_slot: None,
            }),
            generation: AtomicU64::new(0),
            read_only: AtomicBool::new(false),
            writer_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            name: name.into(),
        });
        TempBucket { inner }
    }

    /// Whether the backing currently lives in RAM. Test introspection.
    #[must_use]
    pub fn is_ram(&self) -> bool {
        self.inner.state.read().expect("lock poisoned").backing.is_ram()
    }

    /// Migrate to disk now. Returns `false` if already there.
    pub fn migrate_to_disk(&self) -> Result<bool, StorageError> {
        self.inner.migrate_to_disk()
    }
}

impl Drop for TempBucket {
    fn drop(&mut self) {
        // Last-resort guard for handles dropped without an explicit
        // dispose; RAM accounting must not leak.
        if !self.inner.disposed.load(Ordering::Acquire) {
            self.dispose();
        }
    }
}

impl TempBucketInner {
    fn check_live(&self) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::AlreadyFreed);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Charge growth beyond the current high-water mark to the RAM pool.
    fn account_growth(&self, ram: bool, size: u64) {
        if !ram {
            return;
        }
        let accounted = self.accounted.load(Ordering::Acquire);
        if size > accounted {
            self.accounted.store(size, Ordering::Release);
            self.tracker.add(size - accounted);
        }
    }
}

impl TempStorage for TempBucketInner {
    fn created(&self) -> Instant {
        self.created
    }

    fn is_ram(&self) -> bool {
        self.state.read().expect("lock poisoned").backing.is_ram()
    }

    fn ram_bytes(&self) -> u64 {
        if self.is_ram() {
            self.accounted.load(Ordering::Acquire)
        } else {
            0
        }
    }

    #[instrument(level = "debug", skip(self), fields(name = %self.name))]
    fn migrate_to_disk(&self) -> Result<bool, StorageError> {
        let mut state = self.state.write().expect("lock poisoned");
        self.check_live()?;
        if !state.backing.is_ram() {
            return Ok(false);
        }

        let disk = self.bucket_factory.make_bucket()?;
        let mut out = disk.output_stream_unbuffered()?;
        let mut input = state.backing.as_bucket().input_stream_unbuffered()?;
        io::copy(&mut input, &mut out)?;
        drop(input);

        match &state.writer_slot {
            // A writer is mid-stream: hand it the new sink, positioned at
            // the end of the copied bytes.
            Some(slot) => *slot.lock().expect("lock poisoned") = out,
            None => drop(out),
        }

        let old = mem::replace(&mut state.backing, Backing::Disk(disk));
        self.generation.fetch_add(1, Ordering::AcqRel);
        drop(state);

        if let Backing::Ram(array) = old {
            array.dispose();
        }
        self.tracker.sub(self.accounted.swap(0, Ordering::AcqRel));
        debug!("temp bucket migrated to disk");
        Ok(true)
    }
}

impl Bucket for TempBucket {
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn output_stream_unbuffered(&self) -> Result<Box<dyn Write + Send>, StorageError> {
        self.inner.check_live()?;
        if self.inner.read_only.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly);
        }
        if self.inner.writer_open.swap(true, Ordering::AcqRel) {
            return Err(StorageError::WriterOpen);
        }
        let mut state = self.inner.state.write().expect("lock poisoned");
        let sink = match state.backing.as_bucket().output_stream_unbuffered() {
            Ok(sink) => sink,
            Err(e) => {
                self.inner.writer_open.store(false, Ordering::Release);
                return Err(e);
            }
        };
        // Truncation: readers must not keep replaying the old bytes.
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let slot = Arc::new(Mutex::new(sink));
        state.writer_slot = Some(Arc::clone(&slot));
        drop(state);
        Ok(Box::new(TempBucketWriter {
            inner: Arc::clone(&self.inner),
            slot,
        }))
    }

    fn input_stream_unbuffered(&self) -> Result<Box<dyn Read + Send>, StorageError> {
        self.inner.check_live()?;
        Ok(Box::new(TempBucketReader {
            inner: Arc::clone(&self.inner),
            pos: 0,
            generation: u64::MAX,
            src: None,
        }))
    }

    fn size(&self) -> u64 {
        self.inner
            .state
            .read()
            .expect("lock poisoned")
            .backing
            .as_bucket()
            .size()
    }

    fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Acquire)
    }

    fn set_read_only(&self) {
        self.inner.read_only.store(true, Ordering::Release);
        let state = self.inner.state.read().expect("lock poisoned");
        state.backing.as_bucket().set_read_only();
    }

    fn create_shadow(&self) -> Result<Box<dyn Bucket>, StorageError> {
        // RAM contents could migrate or vanish under a shadow; pin them to
        // disk first.
        self.inner.migrate_to_disk()?;
        let state = self.inner.state.read().expect("lock poisoned");
        state.backing.as_bucket().create_shadow()
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let state = self.inner.state.read().expect("lock poisoned");
        state.backing.as_bucket().close();
    }

    fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.closed.store(true, Ordering::Release);
        let mut state = self.inner.state.write().expect("lock poisoned");
        state.writer_slot = None;
        let old = mem::replace(&mut state.backing, Backing::Disk(Box::new(NullBucket)));
        drop(state);
        let was_ram = old.is_ram();
        old.as_bucket().dispose();
        if was_ram {
            self.inner.tracker.sub(self.inner.accounted.swap(0, Ordering::AcqRel));
        }
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        // RAM contents cannot outlive the process; persist as the disk
        // backing's own record.
        self.inner.check_live()?;
        self.inner.migrate_to_disk()?;
        let state = self.inner.state.read().expect("lock poisoned");
        state.backing.as_bucket().store_to(sink)
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        let state = self.inner.state.read().expect("lock poisoned");
        state.backing.as_bucket().on_resume(ctx)
    }

    fn to_random_access_buffer(
        self: Box<Self>,
    ) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
        self.inner.check_live()?;
        if self.inner.writer_open.load(Ordering::Acquire) {
            return Err(StorageError::WriterOpen);
        }
        self.set_read_only();
        let mut state = self.inner.state.write().expect("lock poisoned");
        let backing = mem::replace(&mut state.backing, Backing::Disk(Box::new(NullBucket)));
        drop(state);
        self.inner.disposed.store(true, Ordering::Release);

        match backing {
            Backing::Ram(array) => {
                // Keep the bytes under temp-storage accounting: hand them
                // to a switchable proxy that the releaser can still
                // migrate.
                self.inner
                    .tracker
                    .sub(self.inner.accounted.swap(0, Ordering::AcqRel));
                let rab = ArrayRab::from_vec_read_only(array.take_data());
                Ok(Box::new(TempRab::adopt_ram(
                    rab,
                    Arc::clone(&self.inner.rab_factory),
                    Arc::clone(&self.inner.tracker),
                    self.inner.created,
                )))
            }
            Backing::Disk(bucket) => bucket.to_random_access_buffer(),
        }
    }
}

struct TempBucketWriter {
    inner: Arc<TempBucketInner>,
    slot: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Write for TempBucketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(io::Error::other("bucket has been freed"));
        }

        // A write that would carry a RAM bucket past its growth ceiling
        // migrates first.
        let must_migrate = {
            let state = self.inner.state.read().expect("lock poisoned");
            state.backing.is_ram()
                && state.backing.as_bucket().size() + buf.len() as u64 > self.inner.max_ram_size
        };
        if must_migrate {
            self.inner.migrate_to_disk().map_err(to_io_error)?;
        }

        let state = self.inner.state.read().expect("lock poisoned");
        let mut sink = self.slot.lock().expect("lock poisoned");
        sink.write_all(buf)?;
        drop(sink);
        self.inner
            .account_growth(state.backing.is_ram(), state.backing.as_bucket().size());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.slot.lock().expect("lock poisoned").flush()
    }
}

impl Drop for TempBucketWriter {
    fn drop(&mut self) {
        let mut state = self.inner.state.write().expect("lock poisoned");
        let slot = state.writer_slot.take();
        drop(state);
        if let Some(slot) = slot {
            // Swap the sink out inside the mutex so it is closed (and any
            // padding applied) before a new writer can open.
            *slot.lock().expect("lock poisoned") = Box::new(io::sink());
        }
        self.inner.writer_open.store(false, Ordering::Release);
    }
}

struct TempBucketReader {
    inner: Arc<TempBucketInner>,
    pos: u64,
    generation: u64,
    src: Option<Box<dyn Read + Send>>,
}

impl Read for TempBucketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Holding the read lock here keeps migration from swapping the
        // backing mid-read.
        let state = self.inner.state.read().expect("lock poisoned");
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(io::Error::other("bucket has been freed"));
        }

        let current = self.inner.generation.load(Ordering::Acquire);
        if self.src.is_none() || self.generation != current {
            let mut src = state
                .backing
                .as_bucket()
                .input_stream_unbuffered()
                .map_err(to_io_error)?;
            if self.pos > 0 {
                let skipped = io::copy(&mut src.by_ref().take(self.pos), &mut io::sink())?;
                if skipped < self.pos {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "backing shrank under an open reader",
                    ));
                }
            }
            self.src = Some(src);
            self.generation = current;
        }

        let n = self.src.as_mut().expect("stream just opened").read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{FileBucket, read_bucket_to_vec};
    use crate::rab::FileRab;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct DirFactory {
        dir: PathBuf,
        counter: AtomicU64,
    }

    impl DirFactory {
        fn shared(dir: &TempDir) -> Arc<Self> {
            Arc::new(DirFactory {
                dir: dir.path().to_path_buf(),
                counter: AtomicU64::new(0),
            })
        }
    }

    impl BucketFactory for DirFactory {
        fn make_bucket(&self) -> Result<Box<dyn Bucket>, StorageError> {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(FileBucket::new(self.dir.join(format!("b{n}")), true)))
        }
    }

    impl RabFactory for DirFactory {
        fn make_rab(&self, size: u64) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(FileRab::create(
                self.dir.join(format!("r{n}")),
                size,
                false,
            )?))
        }
    }

    fn ram_bucket(
        factory: &Arc<DirFactory>,
        tracker: &Arc<TempRamTracker>,
        requested: u64,
        ceiling: u64,
    ) -> TempBucket {
        TempBucket::new_ram(
            "t",
            requested,
            ceiling,
            Arc::clone(factory) as Arc<dyn BucketFactory>,
            Arc::clone(factory) as Arc<dyn RabFactory>,
            Arc::clone(tracker),
        )
    }

    #[test]
    fn accounts_requested_size_at_creation() {
        let dir = TempDir::new().unwrap();
        let factory = DirFactory::shared(&dir);
        let tracker = TempRamTracker::new();
        let bucket = ram_bucket(&factory, &tracker, 1024, 4096);
        assert_eq!(tracker.in_use(), 1024);
        bucket.dispose();
        assert_eq!(tracker.in_use(), 0);
    }

    #[test]
    fn migration_preserves_data() {
        let dir = TempDir::new().unwrap();
        let factory = DirFactory::shared(&dir);
        let tracker = TempRamTracker::new();
        let bucket = ram_bucket(&factory, &tracker, 1024, 4096);

        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 249) as u8).collect();
        bucket.output_stream().unwrap().write_all(&payload).unwrap();
        assert!(bucket.is_ram());

        assert!(bucket.migrate_to_disk().unwrap());
        assert!(!bucket.is_ram());
        assert_eq!(tracker.in_use(), 0);
        assert_eq!(read_bucket_to_vec(&bucket).unwrap(), payload);
    }

    #[test]
    fn growth_past_ceiling_migrates() {
        let dir = TempDir::new().unwrap();
        let factory = DirFactory::shared(&dir);
        let tracker = TempRamTracker::new();
        let bucket = ram_bucket(&factory, &tracker, 64, 256);

        let mut out = bucket.output_stream_unbuffered().unwrap();
        out.write_all(&[1u8; 200]).unwrap();
        assert!(bucket.is_ram());
        out.write_all(&[2u8; 200]).unwrap();
        assert!(!bucket.is_ram(), "crossing the ceiling forces disk");
        drop(out);

        let data = read_bucket_to_vec(&bucket).unwrap();
        assert_eq!(data.len(), 400);
        assert_eq!(&data[..200], &[1u8; 200][..]);
        assert_eq!(&data[200..], &[2u8; 200][..]);
        assert_eq!(tracker.in_use(), 0);
    }

    #[test]
    fn open_reader_survives_migration() {
        let dir = TempDir::new().unwrap();
        let factory = DirFactory::shared(&dir);
        let tracker = TempRamTracker::new();
        let bucket = ram_bucket(&factory, &tracker, 64, 4096);

        bucket.output_stream().unwrap().write_all(b"abcdefgh").unwrap();

        let mut reader = bucket.input_stream_unbuffered().unwrap();
        let mut first = [0u8; 4];
        reader.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"abcd");

        assert!(bucket.migrate_to_disk().unwrap());

        let mut rest = [0u8; 4];
        reader.read_exact(&mut rest).unwrap();
        assert_eq!(&rest, b"efgh");
    }

    #[test]
    fn growth_beyond_request_is_accounted() {
        let dir = TempDir::new().unwrap();
        let factory = DirFactory::shared(&dir);
        let tracker = TempRamTracker::new();
        let bucket = ram_bucket(&factory, &tracker, 100, 4096);
        assert_eq!(tracker.in_use(), 100);

        bucket.output_stream().unwrap().write_all(&[0u8; 300]).unwrap();
        assert_eq!(tracker.in_use(), 300);
        bucket.dispose();
        assert_eq!(tracker.in_use(), 0);
    }

    #[test]
    fn ram_bucket_converts_to_tracked_rab() {
        let dir = TempDir::new().unwrap();
        let factory = DirFactory::shared(&dir);
        let tracker = TempRamTracker::new();
        let bucket = ram_bucket(&factory, &tracker, 64, 4096);
        bucket.output_stream().unwrap().write_all(b"keep me").unwrap();

        let rab = Box::new(bucket).to_random_access_buffer().unwrap();
        // Still charged to the pool, now through the proxy Rab.
        assert_eq!(tracker.in_use(), 7);
        let mut buf = [0u8; 7];
        rab.pread(0, &mut buf).unwrap();
        assert_eq!(&buf, b"keep me");
        rab.dispose();
        assert_eq!(tracker.in_use(), 0);
    }

    #[test]
    fn disk_bucket_passthrough() {
        let dir = TempDir::new().unwrap();
        let factory = DirFactory::shared(&dir);
        let tracker = TempRamTracker::new();
        let backing = factory.make_bucket().unwrap();
        let bucket = TempBucket::new_disk(
            "d",
            backing,
            Arc::clone(&factory) as Arc<dyn BucketFactory>,
            Arc::clone(&factory) as Arc<dyn RabFactory>,
            Arc::clone(&tracker),
        );
        assert!(!bucket.is_ram());
        assert_eq!(tracker.in_use(), 0);
        bucket.output_stream().unwrap().write_all(b"disk-born").unwrap();
        assert_eq!(read_bucket_to_vec(&bucket).unwrap(), b"disk-born");
        assert!(!bucket.migrate_to_disk().unwrap());
    }
}
