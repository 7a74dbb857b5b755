//! Length-hiding padding: on write-stream close, the stored length is
//! grown to the next power of two (minimum 1024) with pseudo-random
//! filler.
//!
//! The filler comes from a non-cryptographic PRNG. The adversary already
//! observes the padded length from outside; the filler's job is fast bulk
//! generation, not indistinguishability.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tracing::warn;

use crate::bucket::Bucket;
use crate::error::StorageError;
use crate::rab::{PaddedRab, RandomAccessBuffer};
use crate::resume::{ResumeContext, codec, magic};

/// `max(size, 1024)` rounded up to the next power of two.
#[must_use]
pub fn padded_size(size: u64) -> u64 {
    size.max(1024).next_power_of_two()
}

/// Pads the underlying bucket on output-stream close; reads and `size()`
/// see only the logical bytes.
pub struct PaddedBucket {
    inner: Arc<PaddedInner>,
}

struct PaddedInner {
    underlying: Box<dyn Bucket>,
    logical: AtomicU64,
}

impl PaddedBucket {
    #[must_use]
    pub fn new(underlying: Box<dyn Bucket>) -> Self {
        let logical = underlying.size();
        PaddedBucket {
            inner: Arc::new(PaddedInner {
                underlying,
                logical: AtomicU64::new(logical),
            }),
        }
    }

    fn wrap(underlying: Box<dyn Bucket>, logical: u64) -> Self {
        let bucket = PaddedBucket::new(underlying);
        bucket.inner.logical.store(logical, Ordering::Release);
        bucket
    }

    pub(crate) fn restore(
        reader: &mut dyn Read,
        ctx: &ResumeContext,
    ) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::PADDED_BUCKET_VERSION, "padded bucket")?;
        let logical = codec::read_u64(reader)?;
        let underlying = crate::resume::restore_bucket_from(reader, ctx)?;
        Ok(PaddedBucket::wrap(underlying, logical))
    }
}

impl Bucket for PaddedBucket {
    fn name(&self) -> String {
        self.inner.underlying.name()
    }

    fn output_stream_unbuffered(&self) -> Result<Box<dyn Write + Send>, StorageError> {
        let sink = self.inner.underlying.output_stream_unbuffered()?;
        self.inner.logical.store(0, Ordering::Release);
        Ok(Box::new(PaddedWriter {
            inner: Arc::clone(&self.inner),
            sink: Some(sink),
        }))
    }

    fn input_stream_unbuffered(&self) -> Result<Box<dyn Read + Send>, StorageError> {
        let logical = self.inner.logical.load(Ordering::Acquire);
        let src = self.inner.underlying.input_stream_unbuffered()?;
        Ok(Box::new(src.take(logical)))
    }

    fn size(&self) -> u64 {
        self.inner.logical.load(Ordering::Acquire)
    }

    fn is_read_only(&self) -> bool {
        self.inner.underlying.is_read_only()
    }

    fn set_read_only(&self) {
        self.inner.underlying.set_read_only();
    }

    fn create_shadow(&self) -> Result<Box<dyn Bucket>, StorageError> {
        let shadow = self.inner.underlying.create_shadow()?;
        Ok(Box::new(PaddedBucket::wrap(
            shadow,
            self.inner.logical.load(Ordering::Acquire),
        )))
    }

    fn close(&self) {
        self.inner.underlying.close();
    }

    fn dispose(&self) {
        self.inner.underlying.dispose();
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        codec::write_u32(sink, magic::PADDED_BUCKET)?;
        codec::write_u32(sink, magic::PADDED_BUCKET_VERSION)?;
        codec::write_u64(sink, self.inner.logical.load(Ordering::Acquire))?;
        self.inner.underlying.store_to(sink)
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        self.inner.underlying.on_resume(ctx)
    }

    fn to_random_access_buffer(
        self: Box<Self>,
    ) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
        self.set_read_only();
        let logical = self.inner.logical.load(Ordering::Acquire);
        let inner = Arc::try_unwrap(self.inner).map_err(|_| StorageError::WriterOpen)?;
        let rab = inner.underlying.to_random_access_buffer()?;
        Ok(Box::new(PaddedRab::new(rab, logical)?))
    }
}

struct PaddedWriter {
    inner: Arc<PaddedInner>,
    sink: Option<Box<dyn Write + Send>>,
}

impl Write for PaddedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| io::Error::other("stream is closed"))?;
        sink.write_all(buf)?;
        self.inner.logical.fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PaddedWriter {
    fn drop(&mut self) {
        let Some(mut sink) = self.sink.take() else {
            return;
        };
        let logical = self.inner.logical.load(Ordering::Acquire);
        let target = padded_size(logical);
        if let Err(e) = write_filler(sink.as_mut(), target - logical) {
            warn!(error = %e, logical, target, "failed to pad bucket on close");
        }
    }
}

fn write_filler(sink: &mut dyn Write, mut remaining: u64) -> io::Result<()> {
    let mut rng = SmallRng::from_os_rng();
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let n = usize::try_from(remaining.min(buf.len() as u64)).expect("chunk fits usize");
        rng.fill_bytes(&mut buf[..n]);
        sink.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    sink.flush()
}
