//! Serialization and restart recovery: storage objects write a
//! reconstruction record, a "restarted" process restores them from it, and
//! `on_resume` re-registers backing files with the commit tracker.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use tempstore_core::bucket::{
    Bucket, DelayedDisposeBucket, EncryptedBucket, FileBucket, PaddedBucket, read_bucket_to_vec,
};
use tempstore_core::crypto::{CryptoType, MasterSecret};
use tempstore_core::rab::{FdPool, PooledFileRab, RandomAccessBuffer};
use tempstore_core::resume::{DelayedDisposable, PersistentFileTracker, ResumeContext};
use tempstore_core::temp::FilenameGenerator;
use tempstore_core::{StorageError, restore_bucket_from, restore_rab_from};

#[derive(Default)]
struct RecordingTracker {
    commit: std::sync::atomic::AtomicU64,
    registered: Mutex<Vec<PathBuf>>,
    pending: Mutex<Vec<Box<dyn DelayedDisposable>>>,
}

impl PersistentFileTracker for RecordingTracker {
    fn commit_id(&self) -> u64 {
        self.commit.load(std::sync::atomic::Ordering::Acquire)
    }

    fn register(&self, path: &Path) {
        self.registered.lock().unwrap().push(path.to_path_buf());
    }

    fn delayed_dispose(&self, handle: Box<dyn DelayedDisposable>, _created_commit_id: u64) {
        self.pending.lock().unwrap().push(handle);
    }
}

struct Harness {
    dir: TempDir,
    tracker: Arc<RecordingTracker>,
    master: MasterSecret,
}

impl Harness {
    fn new() -> Self {
        Harness {
            dir: TempDir::new().unwrap(),
            tracker: Arc::new(RecordingTracker::default()),
            master: MasterSecret::from_bytes([0x42u8; 32]),
        }
    }

    fn context(&self) -> ResumeContext {
        ResumeContext::new(
            Arc::clone(&self.tracker) as Arc<dyn PersistentFileTracker>,
            Some(self.master.clone()),
            Arc::new(FilenameGenerator::new(self.dir.path().join("tmp"), "t-").unwrap()),
            FdPool::new(8),
        )
    }
}

#[test]
fn pooled_file_rab_roundtrips_through_its_record() {
    let harness = Harness::new();
    let ctx = harness.context();
    let path = harness.dir.path().join("pooled");

    let rab = PooledFileRab::create(ctx.pool(), &path, 256, -1).unwrap();
    rab.pwrite(0, b"survives restarts").unwrap();

    let mut record = Vec::new();
    rab.store_to(&mut record).unwrap();
    rab.close();

    let restored = restore_rab_from(&mut Cursor::new(record), &ctx).unwrap();
    restored.on_resume(&ctx).unwrap();
    assert_eq!(restored.size(), 256);
    let mut buf = [0u8; 17];
    restored.pread(0, &mut buf).unwrap();
    assert_eq!(&buf, b"survives restarts");
    assert_eq!(
        harness.tracker.registered.lock().unwrap().as_slice(),
        &[path]
    );
}

#[test]
fn missing_backing_file_fails_resume() {
    let harness = Harness::new();
    let ctx = harness.context();
    let path = harness.dir.path().join("gone");

    let rab = PooledFileRab::create(ctx.pool(), &path, 64, -1).unwrap();
    let mut record = Vec::new();
    rab.store_to(&mut record).unwrap();
    rab.close();
    std::fs::remove_file(&path).unwrap();

    let restored = restore_rab_from(&mut Cursor::new(record), &ctx).unwrap();
    assert!(matches!(
        restored.on_resume(&ctx),
        Err(StorageError::ResumeFailed { .. })
    ));
}

#[test]
fn truncated_backing_file_fails_resume() {
    let harness = Harness::new();
    let ctx = harness.context();
    let path = harness.dir.path().join("short");

    let rab = PooledFileRab::create(ctx.pool(), &path, 64, -1).unwrap();
    let mut record = Vec::new();
    rab.store_to(&mut record).unwrap();
    rab.close();
    std::fs::write(&path, b"too short").unwrap();

    let restored = restore_rab_from(&mut Cursor::new(record), &ctx).unwrap();
    assert!(matches!(
        restored.on_resume(&ctx),
        Err(StorageError::ResumeFailed { .. })
    ));
}

#[test]
fn encrypted_padded_bucket_chain_restores_and_decrypts() {
    let harness = Harness::new();
    let ctx = harness.context();
    let path = harness.dir.path().join("chain");

    let record = {
        let bucket = EncryptedBucket::new(
            CryptoType::ChaCha128,
            Box::new(PaddedBucket::new(Box::new(FileBucket::new(&path, false)))),
            harness.master.clone(),
        );
        bucket
            .output_stream()
            .unwrap()
            .write_all(b"nested wrapper chain")
            .unwrap();

        let mut record = Vec::new();
        bucket.store_to(&mut record).unwrap();
        record
    };

    // The stored file is padded: a power of two, at least 1024.
    let stored = std::fs::metadata(&path).unwrap().len();
    assert_eq!(stored, 1024);

    let restored = restore_bucket_from(&mut Cursor::new(record), &ctx).unwrap();
    restored.on_resume(&ctx).unwrap();
    assert_eq!(restored.size(), 20);
    assert_eq!(
        read_bucket_to_vec(restored.as_ref()).unwrap(),
        b"nested wrapper chain"
    );
}

#[test]
fn encrypted_restore_without_secret_fails() {
    let harness = Harness::new();
    let path = harness.dir.path().join("needs-secret");

    let record = {
        let bucket = EncryptedBucket::new(
            CryptoType::ChaCha256,
            Box::new(FileBucket::new(&path, false)),
            harness.master.clone(),
        );
        bucket.output_stream().unwrap().write_all(b"x").unwrap();
        let mut record = Vec::new();
        bucket.store_to(&mut record).unwrap();
        record
    };

    let secretless = ResumeContext::new(
        Arc::clone(&harness.tracker) as Arc<dyn PersistentFileTracker>,
        None,
        Arc::new(FilenameGenerator::new(harness.dir.path().join("tmp"), "t-").unwrap()),
        FdPool::new(8),
    );
    assert!(matches!(
        restore_bucket_from(&mut Cursor::new(record), &secretless),
        Err(StorageError::ResumeFailed { .. })
    ));
}

#[test]
fn delayed_dispose_commit_id_is_rebuilt_not_restored() {
    let harness = Harness::new();
    let ctx = harness.context();
    let path = harness.dir.path().join("delayed");

    harness
        .tracker
        .commit
        .store(3, std::sync::atomic::Ordering::Release);
    let bucket = DelayedDisposeBucket::new(
        Box::new(FileBucket::new(&path, false)),
        Arc::clone(&harness.tracker) as Arc<dyn PersistentFileTracker>,
    );
    bucket.output_stream().unwrap().write_all(b"late free").unwrap();
    assert_eq!(bucket.created_commit_id(), 3);

    let mut record = Vec::new();
    bucket.store_to(&mut record).unwrap();

    // The tracker has moved on by the time the node restarts.
    harness
        .tracker
        .commit
        .store(9, std::sync::atomic::Ordering::Release);
    let restored = restore_bucket_from(&mut Cursor::new(record), &ctx).unwrap();
    restored.on_resume(&ctx).unwrap();
    assert_eq!(read_bucket_to_vec(restored.as_ref()).unwrap(), b"late free");

    restored.dispose();
    assert_eq!(harness.tracker.pending.lock().unwrap().len(), 1);
}

#[test]
fn persistent_temp_file_is_rehomed_on_restore() {
    let harness = Harness::new();
    let ctx = harness.context();

    // Allocate a persistent-temp ID, then simulate the file having been
    // left in an old location by a previous run.
    let (id, canonical) = ctx.filename_generator().make_random_filename().unwrap();
    let old = harness.dir.path().join("old-location");
    std::fs::rename(&canonical, &old).unwrap();
    std::fs::write(&old, vec![9u8; 32]).unwrap();

    let rab = PooledFileRab::create(ctx.pool(), &old, 32, id).unwrap();
    let mut record = Vec::new();
    rab.store_to(&mut record).unwrap();
    rab.close();

    let restored = restore_rab_from(&mut Cursor::new(record), &ctx).unwrap();
    restored.on_resume(&ctx).unwrap();
    assert!(!old.exists(), "file moved back under the generator's control");
    assert!(canonical.exists());
    let mut buf = [0u8; 32];
    restored.pread(0, &mut buf).unwrap();
    assert_eq!(buf, [9u8; 32]);
}
