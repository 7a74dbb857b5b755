//! Free-space floor enforcement for disk allocations and long writes.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::sys::statvfs::statvfs;
use tracing::{debug, warn};

use crate::error::StorageError;

/// Usable space on the filesystem holding `path`, in bytes.
pub fn usable_space(path: &Path) -> io::Result<u64> {
    let stat = statvfs(path).map_err(io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Gates allocations on `usable > requested + min_disk_space`.
pub struct DiskSpaceChecker {
    dir: PathBuf,
    min_disk_space: u64,
    lock: Mutex<()>,
}

impl DiskSpaceChecker {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, min_disk_space: u64) -> Self {
        DiskSpaceChecker {
            dir: dir.into(),
            min_disk_space,
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn min_disk_space(&self) -> u64 {
        self.min_disk_space
    }

    /// Fail unless the allocation of `requested` bytes leaves the floor
    /// intact. Serialized so concurrent allocations cannot both squeeze
    /// past the same reading.
    pub fn check(&self, requested: u64) -> Result<(), StorageError> {
        let _guard = self.lock.lock().expect("lock poisoned");
        let usable = usable_space(&self.dir)?;
        if usable <= requested.saturating_add(self.min_disk_space) {
            warn!(
                requested,
                usable,
                floor = self.min_disk_space,
                "refusing allocation below the disk-space floor"
            );
            return Err(StorageError::InsufficientDiskSpace {
                requested,
                usable,
                floor: self.min_disk_space,
            });
        }
        debug!(requested, usable, "disk-space check passed");
        Ok(())
    }
}

/// An output stream that re-checks the floor every `check_every` written
/// bytes.
pub struct CheckedWriter {
    sink: Box<dyn Write + Send>,
    checker: Arc<DiskSpaceChecker>,
    check_every: u64,
    written: u64,
    last_checked: u64,
}

impl CheckedWriter {
    #[must_use]
    pub fn new(
        sink: Box<dyn Write + Send>,
        checker: Arc<DiskSpaceChecker>,
        check_every: u64,
    ) -> Self {
        CheckedWriter {
            sink,
            checker,
            check_every: check_every.max(1),
            written: 0,
            last_checked: 0,
        }
    }
}

impl Write for CheckedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written - self.last_checked >= self.check_every {
            self.checker
                .check(self.check_every)
                .map_err(crate::error::to_io_error)?;
            self.last_checked = self.written;
        }
        self.sink.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// A bucket wrapper whose output streams re-check the disk-space floor as
/// they write.
pub struct CheckedBucket {
    inner: Box<dyn crate::bucket::Bucket>,
    checker: Arc<DiskSpaceChecker>,
    check_every: u64,
}

impl CheckedBucket {
    /// Default re-check interval for long writes.
    pub const DEFAULT_CHECK_EVERY: u64 = 4096;

    #[must_use]
    pub fn new(inner: Box<dyn crate::bucket::Bucket>, checker: Arc<DiskSpaceChecker>) -> Self {
        CheckedBucket {
            inner,
            checker,
            check_every: Self::DEFAULT_CHECK_EVERY,
        }
    }
}

impl crate::bucket::Bucket for CheckedBucket {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn output_stream_unbuffered(&self) -> Result<Box<dyn Write + Send>, StorageError> {
        let sink = self.inner.output_stream_unbuffered()?;
        Ok(Box::new(CheckedWriter::new(
            sink,
            Arc::clone(&self.checker),
            self.check_every,
        )))
    }

    fn input_stream_unbuffered(
        &self,
    ) -> Result<Box<dyn std::io::Read + Send>, StorageError> {
        self.inner.input_stream_unbuffered()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn set_read_only(&self) {
        self.inner.set_read_only();
    }

    fn create_shadow(&self) -> Result<Box<dyn crate::bucket::Bucket>, StorageError> {
        self.inner.create_shadow()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn dispose(&self) {
        self.inner.dispose();
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        // The floor is runtime policy, not part of the stored shape; the
        // record is the underlying bucket's.
        self.inner.store_to(sink)
    }

    fn on_resume(&self, ctx: &crate::resume::ResumeContext) -> Result<(), StorageError> {
        self.inner.on_resume(ctx)
    }

    fn to_random_access_buffer(
        self: Box<Self>,
    ) -> Result<Box<dyn crate::rab::RandomAccessBuffer>, StorageError> {
        self.inner.to_random_access_buffer()
    }
}
