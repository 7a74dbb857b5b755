//! Write-shield decorator.

use std::io::Write;

use crate::error::StorageError;
use crate::rab::{RabLock, RandomAccessBuffer};
use crate::resume::{ResumeContext, codec, magic};

/// Rejects every write; everything else delegates to the wrapped buffer.
pub struct ReadOnlyRab {
    inner: Box<dyn RandomAccessBuffer>,
}

impl ReadOnlyRab {
    #[must_use]
    pub fn new(inner: Box<dyn RandomAccessBuffer>) -> Self {
        ReadOnlyRab { inner }
    }

    pub(crate) fn restore(
        reader: &mut dyn std::io::Read,
        ctx: &ResumeContext,
    ) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::READ_ONLY_RAB_VERSION, "read-only wrapper")?;
        Ok(ReadOnlyRab::new(crate::resume::restore_rab_from(reader, ctx)?))
    }
}

impl RandomAccessBuffer for ReadOnlyRab {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.inner.pread(offset, buf)
    }

    fn pwrite(&self, _offset: u64, _buf: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::ReadOnly)
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
        codec::write_u32(sink, magic::READ_ONLY_RAB)?;
        codec::write_u32(sink, magic::READ_ONLY_RAB_VERSION)?;
        self.inner.store_to(sink)
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        self.inner.on_resume(ctx)
    }
}
