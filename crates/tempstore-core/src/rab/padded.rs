//! Logical-size decorator: exposes a smaller size over a larger underlying
//! buffer whose tail is padding.

use std::io::Write;

use crate::error::StorageError;
use crate::rab::{RabLock, RandomAccessBuffer, check_range};
use crate::resume::{ResumeContext, codec, magic};

pub struct PaddedRab {
    inner: Box<dyn RandomAccessBuffer>,
    logical: u64,
}

impl PaddedRab {
    /// Expose `logical` bytes of `inner`. `logical` must not exceed the
    /// underlying size.
    pub fn new(inner: Box<dyn RandomAccessBuffer>, logical: u64) -> Result<Self, StorageError> {
        if logical > inner.size() {
            return Err(StorageError::OutOfRange {
                offset: 0,
                len: logical,
                size: inner.size(),
            });
        }
        Ok(PaddedRab { inner, logical })
    }

    pub(crate) fn restore(
        reader: &mut dyn std::io::Read,
        ctx: &ResumeContext,
    ) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::PADDED_RAB_VERSION, "padded wrapper")?;
        let logical = codec::read_u64(reader)?;
        let inner = crate::resume::restore_rab_from(reader, ctx)?;
        PaddedRab::new(inner, logical)
    }
}

impl RandomAccessBuffer for PaddedRab {
    fn size(&self) -> u64 {
        self.logical
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.logical)?;
        self.inner.pread(offset, buf)
    }

    fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.logical)?;
        self.inner.pwrite(offset, buf)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn dispose(&self) {
        self.inner.dispose();
    }

    fn lock_open(&self) -> Result<RabLock, StorageError> {
        self.inner.lock_open()
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        codec::write_u32(sink, magic::PADDED_RAB)?;
        codec::write_u32(sink, magic::PADDED_RAB_VERSION)?;
        codec::write_u64(sink, self.logical)?;
        self.inner.store_to(sink)
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        self.inner.on_resume(ctx)
    }
}
