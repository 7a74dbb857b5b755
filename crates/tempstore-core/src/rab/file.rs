//! Single-channel file-backed random-access buffer. The channel stays open
//! from construction to close; use [`PooledFileRab`](crate::rab::PooledFileRab)
//! when file-descriptor pressure matters.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use rand::RngCore;
use tracing::warn;

use crate::error::{IoContext, StorageError};
use crate::rab::{RabLock, RandomAccessBuffer, check_range};
use crate::resume::{ResumeContext, codec, magic};

/// A Rab over a regular file with a dedicated open channel.
pub struct FileRab {
    path: PathBuf,
    file: RwLock<Option<Arc<File>>>,
    size: u64,
    read_only: bool,
    delete_on_dispose: bool,
    secure_delete: bool,
    disposed: AtomicBool,
}

impl FileRab {
    /// Create (or truncate) `path` at exactly `size` bytes. With
    /// `preallocate`, the full extent is written out immediately so later
    /// writes cannot fail with a full disk.
    pub fn create(path: impl Into<PathBuf>, size: u64, preallocate: bool) -> Result<Self, StorageError> {
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
        if preallocate {
            write_zeroes(&file, size)
                .map_err(|e| StorageError::io(e, IoContext::new("preallocate").with_path(&path)))?;
        }
        Ok(FileRab {
            path,
            file: RwLock::new(Some(Arc::new(file))),
            size,
            read_only: false,
            delete_on_dispose: true,
            secure_delete: false,
            disposed: AtomicBool::new(false),
        })
    }

    /// Open an existing file; the logical size is the file length.
    pub fn open(path: impl Into<PathBuf>, read_only: bool) -> Result<Self, StorageError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| StorageError::io(e, IoContext::new("open").with_path(&path)))?;
        let size = file
            .metadata()
            .map_err(|e| StorageError::io(e, IoContext::new("stat").with_path(&path)))?
            .len();
        Ok(FileRab {
            path,
            file: RwLock::new(Some(Arc::new(file))),
            size,
            read_only,
            delete_on_dispose: false,
            secure_delete: false,
            disposed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn with_delete_on_dispose(mut self, delete: bool) -> Self {
        self.delete_on_dispose = delete;
        self
    }

    #[must_use]
    pub fn with_secure_delete(mut self, secure: bool) -> Self {
        self.secure_delete = secure;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn restore(reader: &mut dyn io::Read) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::FILE_RAB_VERSION, "file buffer")?;
        let flags = codec::read_u8(reader)?;
        let size = codec::read_u64(reader)?;
        let path = codec::read_path(reader)?;
        let read_only = flags & 0b001 != 0;
        let rab = FileRab::open(&path, read_only).map_err(|e| StorageError::ResumeFailed {
            reason: format!("cannot reopen {}: {e}", path.display()),
        })?;
        if rab.size != size {
            return Err(StorageError::ResumeFailed {
                reason: format!(
                    "file {} has length {}, expected {size}",
                    rab.path.display(),
                    rab.size
                ),
            });
        }
        Ok(rab
            .with_delete_on_dispose(flags & 0b010 != 0)
            .with_secure_delete(flags & 0b100 != 0))
    }

    fn channel(&self) -> Result<Arc<File>, StorageError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::AlreadyFreed);
        }
        self.file
            .read()
            .expect("lock poisoned")
            .clone()
            .ok_or(StorageError::Closed)
    }
}

impl RandomAccessBuffer for FileRab {
    fn size(&self) -> u64 {
        self.size
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.size)?;
        let file = self.channel()?;
        file.read_exact_at(buf, offset).map_err(|e| {
            StorageError::io(
                e,
                IoContext::new("pread")
                    .with_path(&self.path)
                    .with_offset(offset)
                    .with_len(buf.len() as u64),
            )
        })
    }

    fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        check_range(offset, buf.len(), self.size)?;
        let file = self.channel()?;
        file.write_all_at(buf, offset).map_err(|e| {
            StorageError::io(
                e,
                IoContext::new("pwrite")
                    .with_path(&self.path)
                    .with_offset(offset)
                    .with_len(buf.len() as u64),
            )
        })
    }

    fn close(&self) {
        self.file.write().expect("lock poisoned").take();
    }

    fn dispose(&self) {
        self.close();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.delete_on_dispose {
            delete_file(&self.path, self.size, self.secure_delete);
        }
    }

    fn lock_open(&self) -> Result<RabLock, StorageError> {
        self.channel().map(|_| RabLock::noop())
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::AlreadyFreed);
        }
        codec::write_u32(sink, magic::FILE_RAB)?;
        codec::write_u32(sink, magic::FILE_RAB_VERSION)?;
        let flags = u8::from(self.read_only)
            | u8::from(self.delete_on_dispose) << 1
            | u8::from(self.secure_delete) << 2;
        codec::write_u8(sink, flags)?;
        codec::write_u64(sink, self.size)?;
        codec::write_path(sink, &self.path)?;
        Ok(())
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        let len = fs::metadata(&self.path)
            .map_err(|e| StorageError::ResumeFailed {
                reason: format!("file {} missing: {e}", self.path.display()),
            })?
            .len();
        if len != self.size {
            return Err(StorageError::ResumeFailed {
                reason: format!(
                    "file {} has length {len}, expected {}",
                    self.path.display(),
                    self.size
                ),
            });
        }
        ctx.tracker().register(&self.path);
        Ok(())
    }
}

fn write_zeroes(file: &File, len: u64) -> io::Result<()> {
    const CHUNK: usize = 32 * 1024;
    let zeroes = [0u8; CHUNK];
    let mut offset = 0u64;
    while offset < len {
        let n = usize::try_from((len - offset).min(CHUNK as u64)).expect("chunk fits usize");
        file.write_all_at(&zeroes[..n], offset)?;
        offset += n as u64;
    }
    Ok(())
}

/// Remove a backing file, optionally overwriting it with random bytes
/// first so the plaintext cannot be recovered from the platters. Failures
/// are logged, not fatal.
pub(crate) fn delete_file(path: &Path, len: u64, secure: bool) {
    if secure {
        if let Err(e) = overwrite_random(path, len) {
            warn!(path = %path.display(), error = %e, "secure overwrite failed");
        }
    }
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to delete backing file");
        }
    }
}

fn overwrite_random(path: &Path, len: u64) -> io::Result<()> {
    const CHUNK: usize = 32 * 1024;
    let file = OpenOptions::new().write(true).open(path)?;
    let mut rng = rand::rng();
    let mut buf = [0u8; CHUNK];
    let mut offset = 0u64;
    while offset < len {
        let n = usize::try_from((len - offset).min(CHUNK as u64)).expect("chunk fits usize");
        rng.fill_bytes(&mut buf[..n]);
        file.write_all_at(&buf[..n], offset)?;
        offset += n as u64;
    }
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_write_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rab");
        let rab = FileRab::create(&path, 64, false).unwrap();
        rab.pwrite(10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        rab.pread(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(fs::metadata(&path).unwrap().len(), 64);
    }

    #[test]
    fn dispose_deletes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rab");
        let rab = FileRab::create(&path, 8, false).unwrap();
        rab.pwrite(0, &[0, 1, 2, 2, 1, 3, 6, 7]).unwrap();
        rab.dispose();
        assert!(!path.exists());
    }

    #[test]
    fn secure_dispose_deletes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rab");
        let rab = FileRab::create(&path, 4096, false)
            .unwrap()
            .with_secure_delete(true);
        rab.dispose();
        assert!(!path.exists());
    }

    #[test]
    fn closed_after_close() {
        let dir = TempDir::new().unwrap();
        let rab = FileRab::create(dir.path().join("rab"), 8, false).unwrap();
        rab.close();
        assert!(matches!(rab.pread(0, &mut [0u8; 1]), Err(StorageError::Closed)));
    }

    #[test]
    fn preallocate_fills_extent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rab");
        let rab = FileRab::create(&path, 100_000, true).unwrap();
        let mut buf = [1u8; 16];
        rab.pread(99_984, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }
}
