//! Delayed dispose: routing `dispose` through the external commit tracker
//! so backing storage outlives any persistent reference that might still
//! point at it.
//!
//! At `dispose` the wrapper hands an owning handle and its creation-time
//! commit ID to the tracker; the tracker calls
//! [`DelayedDisposable::real_dispose`] once no surviving persistent
//! reference can exist. Between the two, every operation fails with
//! *already-freed*.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::bucket::Bucket;
use crate::error::StorageError;
use crate::rab::{RabLock, RandomAccessBuffer};
use crate::resume::{DelayedDisposable, PersistentFileTracker, ResumeContext, codec, magic};

pub struct DelayedDisposeBucket {
    inner: Arc<DelayedInner<Box<dyn Bucket>>>,
}

pub struct DelayedDisposeRab {
    inner: Arc<DelayedInner<Box<dyn RandomAccessBuffer>>>,
}

struct DelayedInner<T> {
    underlying: T,
    tracker: Arc<dyn PersistentFileTracker>,
    // Transient: re-read from the tracker on resume, never serialized.
    created_commit_id: AtomicU64,
    disposed: AtomicBool,
}

impl<T> DelayedInner<T> {
    fn new(underlying: T, tracker: Arc<dyn PersistentFileTracker>) -> Self {
        let created_commit_id = AtomicU64::new(tracker.commit_id());
        DelayedInner {
            underlying,
            tracker,
            created_commit_id,
            disposed: AtomicBool::new(false),
        }
    }

    fn check_live(&self) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::AlreadyFreed);
        }
        Ok(())
    }
}

struct BucketHandle {
    inner: Arc<DelayedInner<Box<dyn Bucket>>>,
}

impl DelayedDisposable for BucketHandle {
    fn real_dispose(&self) {
        self.inner.underlying.dispose();
    }
}

struct RabHandle {
    inner: Arc<DelayedInner<Box<dyn RandomAccessBuffer>>>,
}

impl DelayedDisposable for RabHandle {
    fn real_dispose(&self) {
        self.inner.underlying.dispose();
    }
}

impl DelayedDisposeBucket {
    #[must_use]
    pub fn new(underlying: Box<dyn Bucket>, tracker: Arc<dyn PersistentFileTracker>) -> Self {
        DelayedDisposeBucket {
            inner: Arc::new(DelayedInner::new(underlying, tracker)),
        }
    }

    #[must_use]
    pub fn created_commit_id(&self) -> u64 {
        self.inner.created_commit_id.load(Ordering::Acquire)
    }

    pub(crate) fn restore(
        reader: &mut dyn Read,
        ctx: &ResumeContext,
    ) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::DELAYED_BUCKET_VERSION, "delayed-dispose bucket")?;
        let underlying = crate::resume::restore_bucket_from(reader, ctx)?;
        Ok(DelayedDisposeBucket::new(underlying, Arc::clone(ctx.tracker())))
    }
}

impl Bucket for DelayedDisposeBucket {
    fn name(&self) -> String {
        self.inner.underlying.name()
    }

    fn output_stream_unbuffered(&self) -> Result<Box<dyn Write + Send>, StorageError> {
        self.inner.check_live()?;
        self.inner.underlying.output_stream_unbuffered()
    }

    fn input_stream_unbuffered(&self) -> Result<Box<dyn Read + Send>, StorageError> {
        self.inner.check_live()?;
        self.inner.underlying.input_stream_unbuffered()
    }

    fn size(&self) -> u64 {
        self.inner.underlying.size()
    }

    fn is_read_only(&self) -> bool {
        self.inner.underlying.is_read_only()
    }

    fn set_read_only(&self) {
        self.inner.underlying.set_read_only();
    }

    fn create_shadow(&self) -> Result<Box<dyn Bucket>, StorageError> {
        self.inner.check_live()?;
        self.inner.underlying.create_shadow()
    }

    fn close(&self) {
        self.inner.underlying.close();
    }

    fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let created = self.inner.created_commit_id.load(Ordering::Acquire);
        self.inner.tracker.delayed_dispose(
            Box::new(BucketHandle {
                inner: Arc::clone(&self.inner),
            }),
            created,
        );
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        self.inner.check_live()?;
        codec::write_u32(sink, magic::DELAYED_BUCKET)?;
        codec::write_u32(sink, magic::DELAYED_BUCKET_VERSION)?;
        self.inner.underlying.store_to(sink)
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        self.inner
            .created_commit_id
            .store(ctx.tracker().commit_id(), Ordering::Release);
        self.inner.underlying.on_resume(ctx)
    }

    fn to_random_access_buffer(
        self: Box<Self>,
    ) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
        self.inner.check_live()?;
        let inner = Arc::try_unwrap(self.inner).map_err(|_| StorageError::WriterOpen)?;
        let rab = inner.underlying.to_random_access_buffer()?;
        Ok(Box::new(DelayedDisposeRab::new(rab, inner.tracker)))
    }
}

impl DelayedDisposeRab {
    #[must_use]
    pub fn new(
        underlying: Box<dyn RandomAccessBuffer>,
        tracker: Arc<dyn PersistentFileTracker>,
    ) -> Self {
        DelayedDisposeRab {
            inner: Arc::new(DelayedInner::new(underlying, tracker)),
        }
    }

    #[must_use]
    pub fn created_commit_id(&self) -> u64 {
        self.inner.created_commit_id.load(Ordering::Acquire)
    }

    pub(crate) fn restore(
        reader: &mut dyn Read,
        ctx: &ResumeContext,
    ) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::DELAYED_RAB_VERSION, "delayed-dispose buffer")?;
        let underlying = crate::resume::restore_rab_from(reader, ctx)?;
        Ok(DelayedDisposeRab::new(underlying, Arc::clone(ctx.tracker())))
    }
}

impl RandomAccessBuffer for DelayedDisposeRab {
    fn size(&self) -> u64 {
        self.inner.underlying.size()
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.inner.check_live()?;
        self.inner.underlying.pread(offset, buf)
    }

    fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        self.inner.check_live()?;
        self.inner.underlying.pwrite(offset, buf)
    }

    fn close(&self) {
        self.inner.underlying.close();
    }

    fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let created = self.inner.created_commit_id.load(Ordering::Acquire);
        self.inner.tracker.delayed_dispose(
            Box::new(RabHandle {
                inner: Arc::clone(&self.inner),
            }),
            created,
        );
    }

    fn lock_open(&self) -> Result<RabLock, StorageError> {
        self.inner.check_live()?;
        self.inner.underlying.lock_open()
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        self.inner.check_live()?;
        codec::write_u32(sink, magic::DELAYED_RAB)?;
        codec::write_u32(sink, magic::DELAYED_RAB_VERSION)?;
        self.inner.underlying.store_to(sink)
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        self.inner
            .created_commit_id
            .store(ctx.tracker().commit_id(), Ordering::Release);
        self.inner.underlying.on_resume(ctx)
    }
}
