//! File-backed bucket.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::bucket::Bucket;
use crate::error::{IoContext, StorageError};
use crate::rab::{FileRab, RandomAccessBuffer};
use crate::rab::file::delete_file;
use crate::resume::{ResumeContext, codec, magic};

/// A bucket stored in a single regular file. The file is created lazily by
/// the first output stream.
pub struct FileBucket {
    inner: Arc<FileInner>,
}

struct FileInner {
    path: PathBuf,
    length: AtomicU64,
    read_only: AtomicBool,
    writer_open: AtomicBool,
    closed: AtomicBool,
    disposed: AtomicBool,
    delete_on_dispose: bool,
    secure_delete: AtomicBool,
}

impl FileBucket {
    /// A bucket over `path`. With `delete_on_dispose`, the file is removed
    /// when the bucket is disposed.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, delete_on_dispose: bool) -> Self {
        let path = path.into();
        let length = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        FileBucket {
            inner: Arc::new(FileInner {
                path,
                length: AtomicU64::new(length),
                read_only: AtomicBool::new(false),
                writer_open: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                delete_on_dispose,
                secure_delete: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn with_secure_delete(self, secure: bool) -> Self {
        self.inner.secure_delete.store(secure, Ordering::Relaxed);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub(crate) fn restore(reader: &mut dyn Read) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::FILE_BUCKET_VERSION, "file bucket")?;
        let flags = codec::read_u8(reader)?;
        let length = codec::read_u64(reader)?;
        let path = codec::read_path(reader)?;
        let bucket = FileBucket::new(path, flags & 0b010 != 0)
            .with_secure_delete(flags & 0b100 != 0);
        bucket.inner.length.store(length, Ordering::Release);
        if flags & 0b001 != 0 {
            bucket.set_read_only();
        }
        Ok(bucket)
    }

    fn check_live(&self) -> Result<(), StorageError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(StorageError::AlreadyFreed);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Bucket for FileBucket {
    fn name(&self) -> String {
        self.inner.path.display().to_string()
    }

    fn output_stream_unbuffered(&self) -> Result<Box<dyn Write + Send>, StorageError> {
        self.check_live()?;
        if self.inner.read_only.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly);
        }
        if self.inner.writer_open.swap(true, Ordering::AcqRel) {
            return Err(StorageError::WriterOpen);
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.inner.path)
            .map_err(|e| {
                self.inner.writer_open.store(false, Ordering::Release);
                StorageError::io(e, IoContext::new("create").with_path(&self.inner.path))
            })?;
        self.inner.length.store(0, Ordering::Release);
        Ok(Box::new(FileBucketWriter {
            inner: Arc::clone(&self.inner),
            file,
        }))
    }

    fn input_stream_unbuffered(&self) -> Result<Box<dyn Read + Send>, StorageError> {
        self.check_live()?;
        match File::open(&self.inner.path) {
            Ok(file) => Ok(Box::new(file)),
            // Never written: an empty bucket, not an error.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Box::new(io::empty())),
            Err(e) => Err(StorageError::io(
                e,
                IoContext::new("open").with_path(&self.inner.path),
            )),
        }
    }

    fn size(&self) -> u64 {
        self.inner.length.load(Ordering::Acquire)
    }

    fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Acquire)
    }

    fn set_read_only(&self) {
        self.inner.read_only.store(true, Ordering::Release);
    }

    fn create_shadow(&self) -> Result<Box<dyn Bucket>, StorageError> {
        self.check_live()?;
        // The shadow reads the same file but never deletes it.
        let shadow = FileBucket::new(self.inner.path.clone(), false);
        shadow.set_read_only();
        Ok(Box::new(shadow))
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn dispose(&self) {
        self.close();
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.inner.delete_on_dispose {
            delete_file(
                &self.inner.path,
                self.inner.length.load(Ordering::Acquire),
                self.inner.secure_delete.load(Ordering::Relaxed),
            );
        }
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        self.check_live()?;
        codec::write_u32(sink, magic::FILE_BUCKET)?;
        codec::write_u32(sink, magic::FILE_BUCKET_VERSION)?;
        let flags = u8::from(self.inner.read_only.load(Ordering::Acquire))
            | u8::from(self.inner.delete_on_dispose) << 1
            | u8::from(self.inner.secure_delete.load(Ordering::Relaxed)) << 2;
        codec::write_u8(sink, flags)?;
        codec::write_u64(sink, self.inner.length.load(Ordering::Acquire))?;
        codec::write_path(sink, &self.inner.path)?;
        Ok(())
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        let expected = self.inner.length.load(Ordering::Acquire);
        let len = fs::metadata(&self.inner.path)
            .map_err(|e| StorageError::ResumeFailed {
                reason: format!("file {} missing: {e}", self.inner.path.display()),
            })?
            .len();
        if len != expected {
            return Err(StorageError::ResumeFailed {
                reason: format!(
                    "file {} has length {len}, expected {expected}",
                    self.inner.path.display()
                ),
            });
        }
        ctx.tracker().register(&self.inner.path);
        Ok(())
    }

    fn to_random_access_buffer(
        self: Box<Self>,
    ) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
        self.check_live()?;
        self.set_read_only();
        let rab = FileRab::open(&self.inner.path, true)?
            .with_delete_on_dispose(self.inner.delete_on_dispose)
            .with_secure_delete(self.inner.secure_delete.load(Ordering::Relaxed));
        // Ownership of the file moves to the Rab; the bucket must not
        // delete it afterwards.
        self.inner.disposed.store(true, Ordering::Release);
        Ok(Box::new(rab))
    }
}

struct FileBucketWriter {
    inner: Arc<FileInner>,
    file: File,
}

impl Write for FileBucketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(io::Error::other("bucket has been freed"));
        }
        self.file.write_all(buf)?;
        self.inner.length.fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for FileBucketWriter {
    fn drop(&mut self) {
        self.inner.writer_open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::read_bucket_to_vec;
    use tempfile::TempDir;

    #[test]
    fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let bucket = FileBucket::new(dir.path().join("b"), true);
        bucket
            .output_stream()
            .unwrap()
            .write_all(b"file bucket data")
            .unwrap();
        assert_eq!(bucket.size(), 16);
        assert_eq!(read_bucket_to_vec(&bucket).unwrap(), b"file bucket data");
    }

    #[test]
    fn dispose_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b");
        let bucket = FileBucket::new(&path, true);
        bucket.output_stream().unwrap().write_all(b"x").unwrap();
        assert!(path.exists());
        bucket.dispose();
        assert!(!path.exists());
    }

    #[test]
    fn shadow_shares_file_without_deleting() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b");
        let bucket = FileBucket::new(&path, true);
        bucket.output_stream().unwrap().write_all(b"shared").unwrap();

        let shadow = bucket.create_shadow().unwrap();
        assert!(shadow.is_read_only());
        assert_eq!(read_bucket_to_vec(shadow.as_ref()).unwrap(), b"shared");
        shadow.dispose();
        assert!(path.exists());
    }

    #[test]
    fn converts_to_rab_and_keeps_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b");
        let bucket = FileBucket::new(&path, true);
        bucket.output_stream().unwrap().write_all(b"0123456789").unwrap();

        let rab = Box::new(bucket).to_random_access_buffer().unwrap();
        assert_eq!(rab.size(), 10);
        let mut buf = [0u8; 4];
        rab.pread(6, &mut buf).unwrap();
        assert_eq!(&buf, b"6789");

        rab.dispose();
        assert!(!path.exists());
    }
}
