//! Magic-tagged serialization and restart recovery.
//!
//! Every storage object writes `MAGIC (u32 be) ‖ VERSION (u32 be) ‖
//! fields`; wrappers nest their underlying object's record. Restoring
//! reads the magic, dispatches to the matching constructor, and recurses.
//! After restoration the outer caller invokes `on_resume`, which walks the
//! wrapper chain registering persistent files with the tracker.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::bucket::{
    ArrayBucket, Bucket, DelayedDisposeBucket, DelayedDisposeRab, EncryptedBucket, FileBucket,
    NullBucket, PaddedBucket,
};
use crate::crypto::MasterSecret;
use crate::error::StorageError;
use crate::rab::{
    ArrayRab, EncryptedRab, FdPool, FileRab, PaddedRab, PooledFileRab, RandomAccessBuffer,
    ReadOnlyRab,
};
use crate::temp::FilenameGenerator;

/// Component magics and record versions. The constants are part of the
/// on-disk format; never renumber them.
pub mod magic {
    pub const ARRAY_RAB: u32 = 0x2e7a10c4;
    pub const ARRAY_RAB_VERSION: u32 = 1;
    pub const FILE_RAB: u32 = 0x8d9f41a3;
    pub const FILE_RAB_VERSION: u32 = 1;
    pub const POOLED_FILE_RAB: u32 = 0x5b3e0d92;
    pub const POOLED_FILE_RAB_VERSION: u32 = 1;
    pub const READ_ONLY_RAB: u32 = 0x648d24da;
    pub const READ_ONLY_RAB_VERSION: u32 = 1;
    pub const PADDED_RAB: u32 = 0x39ea94c2;
    pub const PADDED_RAB_VERSION: u32 = 1;
    pub const ENCRYPTED_RAB: u32 = 0xd8ba4c7e;
    pub const ENCRYPTED_RAB_VERSION: u32 = 1;
    pub const DELAYED_RAB: u32 = 0xf1c4a3b7;
    pub const DELAYED_RAB_VERSION: u32 = 1;

    pub const ARRAY_BUCKET: u32 = 0x9a2d6c15;
    pub const ARRAY_BUCKET_VERSION: u32 = 1;
    pub const FILE_BUCKET: u32 = 0x4f6e1b08;
    pub const FILE_BUCKET_VERSION: u32 = 1;
    pub const NULL_BUCKET: u32 = 0x21c09e5d;
    pub const NULL_BUCKET_VERSION: u32 = 1;
    pub const PADDED_BUCKET: u32 = 0x7d80ff3a;
    pub const PADDED_BUCKET_VERSION: u32 = 1;
    pub const ENCRYPTED_BUCKET: u32 = 0xb6a5392e;
    pub const ENCRYPTED_BUCKET_VERSION: u32 = 1;
    pub const DELAYED_BUCKET: u32 = 0x03dd7b61;
    pub const DELAYED_BUCKET_VERSION: u32 = 1;
}

/// Big-endian field codec for reconstruction records.
pub(crate) mod codec {
    use std::io::{Read, Write};
    use std::path::PathBuf;

    use crate::error::StorageError;

    fn short(e: &std::io::Error) -> StorageError {
        StorageError::ResumeFailed {
            reason: format!("record ended early: {e}"),
        }
    }

    pub fn write_u8(w: &mut dyn Write, v: u8) -> Result<(), StorageError> {
        w.write_all(&[v]).map_err(StorageError::from)
    }

    pub fn write_u32(w: &mut dyn Write, v: u32) -> Result<(), StorageError> {
        w.write_all(&v.to_be_bytes()).map_err(StorageError::from)
    }

    pub fn write_u64(w: &mut dyn Write, v: u64) -> Result<(), StorageError> {
        w.write_all(&v.to_be_bytes()).map_err(StorageError::from)
    }

    pub fn write_i64(w: &mut dyn Write, v: i64) -> Result<(), StorageError> {
        w.write_all(&v.to_be_bytes()).map_err(StorageError::from)
    }

    pub fn write_path(w: &mut dyn Write, path: &std::path::Path) -> Result<(), StorageError> {
        let bytes = path.to_string_lossy();
        let bytes = bytes.as_bytes();
        write_u32(w, u32::try_from(bytes.len()).expect("path fits u32"))?;
        w.write_all(bytes).map_err(StorageError::from)
    }

    pub fn read_exact(r: &mut dyn Read, buf: &mut [u8]) -> Result<(), StorageError> {
        r.read_exact(buf).map_err(|e| short(&e))
    }

    pub fn read_u8(r: &mut dyn Read) -> Result<u8, StorageError> {
        let mut buf = [0u8; 1];
        read_exact(r, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u32(r: &mut dyn Read) -> Result<u32, StorageError> {
        let mut buf = [0u8; 4];
        read_exact(r, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_u64(r: &mut dyn Read) -> Result<u64, StorageError> {
        let mut buf = [0u8; 8];
        read_exact(r, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn read_i64(r: &mut dyn Read) -> Result<i64, StorageError> {
        let mut buf = [0u8; 8];
        read_exact(r, &mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    pub fn read_path(r: &mut dyn Read) -> Result<PathBuf, StorageError> {
        let len = read_u32(r)? as usize;
        let mut bytes = vec![0u8; len];
        read_exact(r, &mut bytes)?;
        let s = String::from_utf8(bytes).map_err(|e| StorageError::StorageFormat {
            reason: format!("path is not valid UTF-8: {e}"),
        })?;
        Ok(PathBuf::from(s))
    }

    /// Read the record version and reject anything but `expected`.
    pub fn check_version(
        r: &mut dyn Read,
        expected: u32,
        what: &str,
    ) -> Result<(), StorageError> {
        let version = read_u32(r)?;
        if version != expected {
            return Err(StorageError::StorageFormat {
                reason: format!("{what} record version {version}, expected {expected}"),
            });
        }
        Ok(())
    }
}

/// The external persistent-file commit tracker (out of scope here; the
/// node provides it). `commit_id` is monotonic; `delayed_dispose` receives
/// the only live owning handle to the storage being freed and calls
/// [`DelayedDisposable::real_dispose`] once no surviving persistent
/// reference can exist.
pub trait PersistentFileTracker: Send + Sync {
    fn commit_id(&self) -> u64;
    fn register(&self, path: &Path);
    fn delayed_dispose(&self, handle: Box<dyn DelayedDisposable>, created_commit_id: u64);
}

/// An owning handle to storage awaiting its real dispose.
pub trait DelayedDisposable: Send + Sync {
    fn real_dispose(&self);
}

/// Everything a restored object needs to re-attach to the runtime.
pub struct ResumeContext {
    tracker: Arc<dyn PersistentFileTracker>,
    master_secret: Option<MasterSecret>,
    filename_generator: Arc<FilenameGenerator>,
    pool: Arc<FdPool>,
}

impl ResumeContext {
    #[must_use]
    pub fn new(
        tracker: Arc<dyn PersistentFileTracker>,
        master_secret: Option<MasterSecret>,
        filename_generator: Arc<FilenameGenerator>,
        pool: Arc<FdPool>,
    ) -> Self {
        ResumeContext {
            tracker,
            master_secret,
            filename_generator,
            pool,
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<dyn PersistentFileTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn master_secret(&self) -> Option<&MasterSecret> {
        self.master_secret.as_ref()
    }

    #[must_use]
    pub fn filename_generator(&self) -> &Arc<FilenameGenerator> {
        &self.filename_generator
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<FdPool> {
        &self.pool
    }
}

/// Restore a random-access buffer from its reconstruction record.
pub fn restore_rab_from(
    reader: &mut dyn Read,
    ctx: &ResumeContext,
) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
    let tag = codec::read_u32(reader)?;
    match tag {
        magic::ARRAY_RAB => Ok(Box::new(ArrayRab::restore(reader)?)),
        magic::FILE_RAB => Ok(Box::new(FileRab::restore(reader)?)),
        magic::POOLED_FILE_RAB => Ok(Box::new(PooledFileRab::restore(reader, ctx)?)),
        magic::READ_ONLY_RAB => Ok(Box::new(ReadOnlyRab::restore(reader, ctx)?)),
        magic::PADDED_RAB => Ok(Box::new(PaddedRab::restore(reader, ctx)?)),
        magic::ENCRYPTED_RAB => Ok(Box::new(EncryptedRab::restore(reader, ctx)?)),
        magic::DELAYED_RAB => Ok(Box::new(DelayedDisposeRab::restore(reader, ctx)?)),
        other => Err(StorageError::StorageFormat {
            reason: format!("unknown random-access buffer magic {other:#010x}"),
        }),
    }
}

/// Restore a bucket from its reconstruction record.
pub fn restore_bucket_from(
    reader: &mut dyn Read,
    ctx: &ResumeContext,
) -> Result<Box<dyn Bucket>, StorageError> {
    let tag = codec::read_u32(reader)?;
    match tag {
        magic::ARRAY_BUCKET => Ok(Box::new(ArrayBucket::restore(reader)?)),
        magic::FILE_BUCKET => Ok(Box::new(FileBucket::restore(reader)?)),
        magic::NULL_BUCKET => Ok(Box::new(NullBucket::restore(reader)?)),
        magic::PADDED_BUCKET => Ok(Box::new(PaddedBucket::restore(reader, ctx)?)),
        magic::ENCRYPTED_BUCKET => Ok(Box::new(EncryptedBucket::restore(reader, ctx)?)),
        magic::DELAYED_BUCKET => Ok(Box::new(DelayedDisposeBucket::restore(reader, ctx)?)),
        other => Err(StorageError::StorageFormat {
            reason: format!("unknown bucket magic {other:#010x}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct NullTracker {
        registered: Mutex<Vec<std::path::PathBuf>>,
    }

    impl PersistentFileTracker for NullTracker {
        fn commit_id(&self) -> u64 {
            0
        }
        fn register(&self, path: &Path) {
            self.registered.lock().unwrap().push(path.to_path_buf());
        }
        fn delayed_dispose(&self, handle: Box<dyn DelayedDisposable>, _created_commit_id: u64) {
            handle.real_dispose();
        }
    }

    fn context(dir: &TempDir) -> ResumeContext {
        ResumeContext::new(
            Arc::new(NullTracker::default()),
            Some(MasterSecret::from_bytes([5u8; 32])),
            Arc::new(FilenameGenerator::new(dir.path().join("tmp"), "t-").unwrap()),
            FdPool::new(8),
        )
    }

    #[test]
    fn unknown_magic_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let mut cursor = Cursor::new(0xdeadbeefu32.to_be_bytes().to_vec());
        assert!(matches!(
            restore_rab_from(&mut cursor, &context(&dir)),
            Err(StorageError::StorageFormat { .. })
        ));
    }

    #[test]
    fn short_record_is_a_resume_failure() {
        let dir = TempDir::new().unwrap();
        let mut cursor = Cursor::new(vec![0u8; 2]);
        assert!(matches!(
            restore_bucket_from(&mut cursor, &context(&dir)),
            Err(StorageError::ResumeFailed { .. })
        ));
    }

    #[test]
    fn array_rab_roundtrips_inline() {
        let dir = TempDir::new().unwrap();
        let rab = ArrayRab::from_vec(vec![1, 2, 3, 4, 5]);
        let mut record = Vec::new();
        rab.store_to(&mut record).unwrap();

        let restored = restore_rab_from(&mut Cursor::new(record), &context(&dir)).unwrap();
        assert_eq!(restored.size(), 5);
        let mut buf = [0u8; 5];
        restored.pread(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn wrong_version_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let mut record = Vec::new();
        codec::write_u32(&mut record, magic::ARRAY_RAB).unwrap();
        codec::write_u32(&mut record, 99).unwrap();
        codec::write_u64(&mut record, 0).unwrap();
        assert!(matches!(
            restore_rab_from(&mut Cursor::new(record), &context(&dir)),
            Err(StorageError::StorageFormat { .. })
        ));
    }

    #[test]
    fn nested_wrapper_roundtrip() {
        let dir = TempDir::new().unwrap();
        let inner = ArrayRab::from_vec(vec![7u8; 64]);
        let wrapped = ReadOnlyRab::new(Box::new(
            PaddedRab::new(Box::new(inner), 10).unwrap(),
        ));
        let mut record = Vec::new();
        wrapped.store_to(&mut record).unwrap();

        let restored = restore_rab_from(&mut Cursor::new(record), &context(&dir)).unwrap();
        assert_eq!(restored.size(), 10);
        assert!(matches!(
            restored.pwrite(0, &[0]),
            Err(StorageError::ReadOnly)
        ));
    }
}
