//! The temp-storage manager: hands out buckets and Rabs, decides RAM vs
//! disk at creation, keeps the RAM pool within bounds, and optionally
//! wraps every disk allocation in padding plus authenticated encryption.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bucket::{Bucket, BucketFactory, EncryptedBucket, PaddedBucket, FileBucket, padded_size};
use crate::crypto::{CryptoType, MasterSecret};
use crate::error::StorageError;
use crate::rab::{
    EncryptedRab, FdPool, PaddedRab, PooledFileRab, RabFactory, RandomAccessBuffer, TempRab,
};
use crate::temp::bucket::TempBucket;
use crate::temp::diskspace::{CheckedBucket, DiskSpaceChecker};
use crate::temp::filename::FilenameGenerator;
use crate::temp::tracker::TempRamTracker;

/// Multiplier on `max_init_single_ram_size` giving the ceiling a single
/// RAM-backed storage may grow to before it must migrate.
pub const RAM_CONVERSION_FACTOR: u64 = 4;

/// RAM-backed storage older than this is migrated by the releaser.
pub const RAM_STORAGE_MAX_AGE: Duration = Duration::from_secs(300);

/// Pool-usage ratio at which the releaser is triggered.
pub const MAX_USAGE_HIGH: f64 = 0.9;

/// Pool-usage ratio the releaser drains down to.
pub const MAX_USAGE_LOW: f64 = 0.8;

/// Where the releaser runs. The node passes its own single-threaded
/// executor; [`WorkerExecutor`] is the stand-alone implementation.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// A dedicated worker thread draining a job queue in submission order.
pub struct WorkerExecutor {
    tx: mpsc::Sender<Box<dyn FnOnce() + Send>>,
    handle: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerExecutor {
    #[must_use]
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .expect("failed to spawn executor thread");
        WorkerExecutor {
            tx,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }
}

impl Executor for WorkerExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        // A send can only fail after shutdown; drop the job then.
        let _ = self.tx.send(job);
    }
}

impl Drop for WorkerExecutor {
    fn drop(&mut self) {
        let (dead_tx, _) = mpsc::channel();
        // Replacing the sender closes the queue and ends the worker loop.
        let _ = std::mem::replace(&mut self.tx, dead_tx);
        if let Some(handle) = self.handle.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

/// Manager configuration. Constructed in code by the embedding node; there
/// is no CLI or environment surface at this layer.
pub struct TempStorageConfig {
    /// Directory for temp files. Created if missing; stale `prefix*`
    /// entries are wiped at startup.
    pub tmp_dir: PathBuf,
    /// Temp-file name prefix.
    pub prefix: String,
    /// Largest request admitted to RAM backing.
    pub max_init_single_ram_size: u64,
    /// Total RAM budget across all temp storage.
    pub ram_pool_size: u64,
    /// Free disk space to keep on top of any single allocation.
    pub min_disk_space: u64,
    /// Cap on concurrently open temp-file descriptors.
    pub max_open_files: usize,
    /// Wrap disk-backed storage in padding + encryption.
    pub encrypt: bool,
    pub crypto_type: CryptoType,
    /// Required when `encrypt` is set.
    pub master_secret: Option<MasterSecret>,
    /// Overwrite-then-remove when deleting temp files.
    pub secure_delete: bool,
}

impl TempStorageConfig {
    #[must_use]
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        TempStorageConfig {
            tmp_dir: tmp_dir.into(),
            prefix: "temp-".to_string(),
            max_init_single_ram_size: 4096,
            ram_pool_size: 1 << 20,
            min_disk_space: 1 << 20,
            max_open_files: 100,
            encrypt: false,
            crypto_type: CryptoType::ChaCha256,
            master_secret: None,
            secure_delete: false,
        }
    }
}

/// Hands out temp buckets and Rabs behind the storage traits.
pub struct TempStorageManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    max_init_single_ram_size: u64,
    ram_pool_size: u64,
    tracker: Arc<TempRamTracker>,
    disk: Arc<DiskFactory>,
    executor: Arc<dyn Executor>,
    releaser_running: AtomicBool,
    counter: AtomicU64,
}

/// Produces the on-disk leaves (and their policy wrappers) for fresh
/// allocations and for migration targets.
struct DiskFactory {
    filename_gen: Arc<FilenameGenerator>,
    checker: Arc<DiskSpaceChecker>,
    pool: Arc<FdPool>,
    encrypt: AtomicBool,
    crypto_type: CryptoType,
    master: Option<MasterSecret>,
    secure_delete: bool,
}

impl DiskFactory {
    fn encrypting(&self) -> Option<(&MasterSecret, CryptoType)> {
        if self.encrypt.load(Ordering::Acquire) {
            self.master.as_ref().map(|m| (m, self.crypto_type))
        } else {
            None
        }
    }
}

impl BucketFactory for DiskFactory {
    fn make_bucket(&self) -> Result<Box<dyn Bucket>, StorageError> {
        // Size is unknown up front; the checked output stream keeps
        // watching the floor as data arrives.
        self.checker.check(0)?;
        let (_, path) = self.filename_gen.make_random_filename()?;
        let file = FileBucket::new(path, true).with_secure_delete(self.secure_delete);
        let mut bucket: Box<dyn Bucket> =
            Box::new(CheckedBucket::new(Box::new(file), Arc::clone(&self.checker)));
        if let Some((master, kind)) = self.encrypting() {
            bucket = Box::new(PaddedBucket::new(bucket));
            bucket = Box::new(EncryptedBucket::new(kind, bucket, master.clone()));
        }
        Ok(bucket)
    }
}

impl RabFactory for DiskFactory {
    fn make_rab(&self, size: u64) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
        if let Some((master, kind)) = self.encrypting() {
            let inner_len = size + kind.header_len() as u64;
            let file_len = padded_size(inner_len);
            self.checker.check(file_len)?;
            let (id, path) = self.filename_gen.make_random_filename()?;
            let file = PooledFileRab::create(&self.pool, path, file_len, id)?
                .with_secure_delete(self.secure_delete);
            let padded = PaddedRab::new(Box::new(file), inner_len)?;
            Ok(Box::new(EncryptedRab::create(kind, Box::new(padded), master)?))
        } else {
            self.checker.check(size)?;
            let (id, path) = self.filename_gen.make_random_filename()?;
            Ok(Box::new(
                PooledFileRab::create(&self.pool, path, size, id)?
                    .with_secure_delete(self.secure_delete),
            ))
        }
    }
}

impl TempStorageManager {
    /// Build the manager, wiping stale temp files from previous runs.
    /// Without an explicit executor the releaser gets its own worker
    /// thread.
    pub fn new(
        config: TempStorageConfig,
        executor: Option<Arc<dyn Executor>>,
    ) -> Result<Self, StorageError> {
        let filename_gen = Arc::new(FilenameGenerator::new(&config.tmp_dir, &config.prefix)?);
        filename_gen.wipe_existing_files()?;
        let checker = Arc::new(DiskSpaceChecker::new(&config.tmp_dir, config.min_disk_space));
        let pool = FdPool::new(config.max_open_files);

        let disk = Arc::new(DiskFactory {
            filename_gen,
            checker,
            pool,
            encrypt: AtomicBool::new(config.encrypt),
            crypto_type: config.crypto_type,
            master: config.master_secret,
            secure_delete: config.secure_delete,
        });

        info!(
            tmp_dir = %config.tmp_dir.display(),
            ram_pool_size = config.ram_pool_size,
            encrypt = config.encrypt,
            "temp storage manager up"
        );

        Ok(TempStorageManager {
            shared: Arc::new(ManagerShared {
                max_init_single_ram_size: config.max_init_single_ram_size,
                ram_pool_size: config.ram_pool_size,
                tracker: TempRamTracker::new(),
                disk,
                executor: executor
                    .unwrap_or_else(|| Arc::new(WorkerExecutor::new("tempstore-releaser"))),
                releaser_running: AtomicBool::new(false),
                counter: AtomicU64::new(0),
            }),
        })
    }

    /// RAM bytes currently in use by live temp storage.
    #[must_use]
    pub fn ram_in_use(&self) -> u64 {
        self.shared.tracker.in_use()
    }

    /// The tracker shared by everything this manager hands out.
    #[must_use]
    pub fn tracker(&self) -> &Arc<TempRamTracker> {
        &self.shared.tracker
    }

    /// The FD pool backing this manager's pooled files.
    #[must_use]
    pub fn pool(&self) -> &Arc<FdPool> {
        &self.shared.disk.pool
    }

    #[must_use]
    pub fn filename_generator(&self) -> &Arc<FilenameGenerator> {
        &self.shared.disk.filename_gen
    }

    /// Toggle the encryption layer for *future* disk allocations. Existing
    /// storage is unaffected.
    pub fn set_encrypt(&self, encrypt: bool) {
        self.shared.disk.encrypt.store(encrypt, Ordering::Release);
    }

    fn admit_to_ram(&self, requested: u64) -> bool {
        let in_use = self.shared.tracker.in_use();
        requested > 0
            && requested <= self.shared.max_init_single_ram_size
            && in_use < self.shared.ram_pool_size
            && in_use + requested <= self.shared.ram_pool_size
    }

    /// Create a temp bucket. `size_hint` drives the RAM-vs-disk admission
    /// decision; the bucket may grow past it.
    pub fn make_bucket(&self, size_hint: u64) -> Result<TempBucket, StorageError> {
        let name = format!("temp-{}", self.shared.counter.fetch_add(1, Ordering::Relaxed));
        let bucket = if self.admit_to_ram(size_hint) {
            debug!(name, size_hint, "RAM-backed temp bucket");
            TempBucket::new_ram(
                name,
                size_hint,
                RAM_CONVERSION_FACTOR * self.shared.max_init_single_ram_size,
                Arc::clone(&self.shared.disk) as Arc<dyn BucketFactory>,
                Arc::clone(&self.shared.disk) as Arc<dyn RabFactory>,
                Arc::clone(&self.shared.tracker),
            )
        } else {
            debug!(name, size_hint, "disk-backed temp bucket");
            let backing = self.shared.disk.make_bucket()?;
            TempBucket::new_disk(
                name,
                backing,
                Arc::clone(&self.shared.disk) as Arc<dyn BucketFactory>,
                Arc::clone(&self.shared.disk) as Arc<dyn RabFactory>,
                Arc::clone(&self.shared.tracker),
            )
        };
        self.maybe_start_releaser();
        Ok(bucket)
    }

    /// Create a fixed-size temp Rab.
    pub fn make_rab(&self, size: u64) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
        let rab: Box<dyn RandomAccessBuffer> = if self.admit_to_ram(size) {
            debug!(size, "RAM-backed temp Rab");
            Box::new(TempRab::new_ram(
                size,
                Arc::clone(&self.shared.disk) as Arc<dyn RabFactory>,
                Arc::clone(&self.shared.tracker),
            ))
        } else {
            debug!(size, "disk-backed temp Rab");
            self.shared.disk.make_rab(size)?
        };
        self.maybe_start_releaser();
        Ok(rab)
    }

    fn maybe_start_releaser(&self) {
        let in_use = self.shared.tracker.in_use() as f64;
        if in_use < self.shared.ram_pool_size as f64 * MAX_USAGE_HIGH {
            return;
        }
        if self.shared.releaser_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.executor.execute(Box::new(move || {
            run_releaser(&shared, RAM_STORAGE_MAX_AGE);
            shared.releaser_running.store(false, Ordering::Release);
        }));
    }

    /// Run one releaser pass synchronously on the calling thread. Mostly
    /// useful for embedders that want a deterministic drain point.
    pub fn run_releaser_now(&self, max_age: Duration) {
        run_releaser(&self.shared, max_age);
    }
}

/// Age pass, then pressure pass. *insufficient-disk-space* is retried
/// forever with a one-second back-off, logging once per stretch; any other
/// migration failure skips that storage.
fn run_releaser(shared: &Arc<ManagerShared>, max_age: Duration) {
    debug!(in_use = shared.tracker.in_use(), "releaser pass starting");

    for storage in shared.tracker.snapshot_ram() {
        if storage.created().elapsed() > max_age {
            migrate_with_retry(storage.as_ref());
        }
    }

    let low = (shared.ram_pool_size as f64 * MAX_USAGE_LOW) as u64;
    while shared.tracker.in_use() > low {
        let before = shared.tracker.in_use();
        let Some(oldest) = shared.tracker.snapshot_ram().into_iter().next() else {
            break;
        };
        migrate_with_retry(oldest.as_ref());
        if shared.tracker.in_use() >= before {
            // A migration that fails for anything other than disk space
            // gets skipped; without progress there is nothing left to do.
            break;
        }
    }

    debug!(in_use = shared.tracker.in_use(), "releaser pass done");
}

fn migrate_with_retry(storage: &dyn crate::temp::tracker::TempStorage) {
    let mut logged = false;
    loop {
        match storage.migrate_to_disk() {
            Ok(_) => return,
            Err(e) if e.is_disk_space() => {
                if !logged {
                    warn!(error = %e, "migration blocked on disk space, retrying");
                    logged = true;
                }
                thread::sleep(Duration::from_secs(1));
            }
            Err(e) => {
                warn!(error = %e, "migration failed");
                return;
            }
        }
    }
}
