//! Pure-memory random-access buffer.

use std::io::Write;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::StorageError;
use crate::rab::{RabLock, RandomAccessBuffer, check_range};
use crate::resume::{ResumeContext, codec, magic};

/// A Rab backed by a heap array. Reads and writes are internally
/// serialized by a reader-writer lock.
pub struct ArrayRab {
    data: RwLock<Box<[u8]>>,
    size: u64,
    read_only: bool,
    closed: AtomicBool,
    disposed: AtomicBool,
}

impl ArrayRab {
    /// A zero-filled buffer of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        ArrayRab::from_vec(vec![0u8; size])
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        ArrayRab {
            size: data.len() as u64,
            data: RwLock::new(data.into_boxed_slice()),
            read_only: false,
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn from_vec_read_only(data: Vec<u8>) -> Self {
        ArrayRab {
            size: data.len() as u64,
            data: RwLock::new(data.into_boxed_slice()),
            read_only: true,
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn restore(
        reader: &mut dyn std::io::Read,
    ) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::ARRAY_RAB_VERSION, "array buffer")?;
        let size = codec::read_u64(reader)?;
        let mut data = vec![0u8; usize::try_from(size).map_err(|_| StorageError::ResumeFailed {
            reason: format!("array buffer of {size} bytes does not fit in memory"),
        })?];
        codec::read_exact(reader, &mut data)?;
        Ok(ArrayRab::from_vec(data))
    }

    fn check_live(&self) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::AlreadyFreed);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl RandomAccessBuffer for ArrayRab {
    fn size(&self) -> u64 {
        self.size
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_live()?;
        check_range(offset, buf.len(), self.size)?;
        let data = self.data.read().expect("lock poisoned");
        let start = usize::try_from(offset).expect("in-memory offset fits usize");
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        self.check_live()?;
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        check_range(offset, buf.len(), self.size)?;
        let mut data = self.data.write().expect("lock poisoned");
        let start = usize::try_from(offset).expect("in-memory offset fits usize");
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn dispose(&self) {
        self.close();
        if !self.disposed.swap(true, Ordering::AcqRel) {
            // Release the memory eagerly instead of waiting for drop.
            *self.data.write().expect("lock poisoned") = Box::new([]);
        }
    }

    fn lock_open(&self) -> Result<RabLock, StorageError> {
        self.check_live()?;
        Ok(RabLock::noop())
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        self.check_live()?;
        codec::write_u32(sink, magic::ARRAY_RAB)?;
        codec::write_u32(sink, magic::ARRAY_RAB_VERSION)?;
        codec::write_u64(sink, self.size)?;
        let data = self.data.read().expect("lock poisoned");
        sink.write_all(&data).map_err(StorageError::from)?;
        Ok(())
    }

    fn on_resume(&self, _ctx: &ResumeContext) -> Result<(), StorageError> {
        Ok(())
    }
}
