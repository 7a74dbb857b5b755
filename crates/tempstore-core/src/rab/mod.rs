//! Random-access buffers: fixed-size, seekable byte containers with
//! positional read/write and lock-to-keep-open semantics.
//!
//! Leaves ([`ArrayRab`], [`FileRab`], [`PooledFileRab`]) own the bytes;
//! wrappers ([`ReadOnlyRab`], [`PaddedRab`], [`EncryptedRab`], [`TempRab`])
//! compose behaviour on top and exclusively own their underlying buffer.

pub mod array;
pub mod encrypted;
pub mod file;
pub mod padded;
pub mod pool;
pub mod readonly;
pub mod temp;

use std::io::Write;

use crate::error::StorageError;
use crate::resume::ResumeContext;

/// A fixed-size byte container with positional I/O.
///
/// The size is fixed from creation until dispose. All operations are safe
/// to call from multiple threads; implementations serialize internally
/// where required. `close` is idempotent; `dispose` implies close and may
/// delete backing storage.
pub trait RandomAccessBuffer: Send + Sync {
    /// Logical size in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` from position `offset`. Full-buffer semantics: partial
    /// reads are retried internally until the buffer is filled or an error
    /// occurs.
    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write all of `buf` at position `offset`.
    fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError>;

    /// Close the buffer. Idempotent; subsequent I/O fails with *closed*.
    fn close(&self);

    /// Dispose of the buffer, deleting backing storage where applicable.
    /// Implies close.
    fn dispose(&self);

    /// Keep the backing channel open until the returned lock is dropped.
    /// For pooled buffers this pins the file descriptor; for everything
    /// else it is a no-op.
    fn lock_open(&self) -> Result<RabLock, StorageError>;

    /// Write a magic-tagged reconstruction record.
    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError>;

    /// Re-attach to the runtime after a restart: register persistent files
    /// with the tracker and verify the backing still matches.
    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError>;
}

/// Produces random-access buffers of a requested size. The temp-storage
/// manager's disk factory implements this; the switchable temp Rab asks it
/// for a successor when migrating.
pub trait RabFactory: Send + Sync {
    fn make_rab(&self, size: u64) -> Result<Box<dyn RandomAccessBuffer>, StorageError>;
}

/// Scoped "keep this channel open" right. Released on drop, on every exit
/// path.
pub struct RabLock {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RabLock {
    pub(crate) fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        RabLock {
            release: Some(Box::new(release)),
        }
    }

    /// A lock over storage whose channel is always open.
    #[must_use]
    pub(crate) fn noop() -> Self {
        RabLock { release: None }
    }

    /// Release explicitly (equivalent to dropping).
    pub fn unlock(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for RabLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Validate `offset + buf_len` against `size`.
pub(crate) fn check_range(offset: u64, buf_len: usize, size: u64) -> Result<(), StorageError> {
    let len = buf_len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StorageError::OutOfRange {
            offset,
            len,
            size,
        }),
    }
}

/// Copy `len` bytes from `src` to `dst` in bounded chunks. Used by the
/// migration paths.
pub(crate) fn copy_rab(
    src: &dyn RandomAccessBuffer,
    dst: &dyn RandomAccessBuffer,
    len: u64,
) -> Result<(), StorageError> {
    const CHUNK: usize = 32 * 1024;
    let mut buf = vec![0u8; CHUNK.min(usize::try_from(len).unwrap_or(CHUNK))];
    let mut offset = 0u64;
    while offset < len {
        let n = usize::try_from((len - offset).min(buf.len() as u64)).expect("chunk fits usize");
        src.pread(offset, &mut buf[..n])?;
        dst.pwrite(offset, &buf[..n])?;
        offset += n as u64;
    }
    Ok(())
}

pub use array::ArrayRab;
pub use encrypted::EncryptedRab;
pub use file::FileRab;
pub use padded::PaddedRab;
pub use pool::{FdPool, PooledFileRab};
pub use readonly::ReadOnlyRab;
pub use temp::TempRab;
