//! Reference-counted multi-reader over a shared underlying bucket.
//!
//! Every reader holds one strong count on the shared state; the last one
//! out disposes the underlying bucket. Dropping a reader without an
//! explicit dispose releases its count too, so a leaked shadow cannot leak
//! the underlying bucket forever.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::bucket::Bucket;
use crate::error::StorageError;
use crate::rab::RandomAccessBuffer;
use crate::resume::ResumeContext;

pub struct ReaderBucket {
    state: Arc<ShadowState>,
    disposed: AtomicBool,
}

struct ShadowState {
    underlying: Box<dyn Bucket>,
    readers: AtomicUsize,
    closed: AtomicBool,
}

impl ReaderBucket {
    /// Take ownership of `underlying` and become its first reader.
    #[must_use]
    pub fn new(underlying: Box<dyn Bucket>) -> Self {
        underlying.set_read_only();
        ReaderBucket {
            state: Arc::new(ShadowState {
                underlying,
                readers: AtomicUsize::new(1),
                closed: AtomicBool::new(false),
            }),
            disposed: AtomicBool::new(false),
        }
    }

    /// Number of live readers. Test introspection.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.readers.load(Ordering::Acquire)
    }

    fn check_live(&self) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::Acquire) || self.state.closed.load(Ordering::Acquire) {
            return Err(StorageError::AlreadyFreed);
        }
        Ok(())
    }

    fn release(&self) {
        if self.state.readers.fetch_sub(1, Ordering::AcqRel) == 1
            && !self.state.closed.swap(true, Ordering::AcqRel)
        {
            self.state.underlying.dispose();
        }
    }
}

impl Bucket for ReaderBucket {
    fn name(&self) -> String {
        self.state.underlying.name()
    }

    fn output_stream_unbuffered(&self) -> Result<Box<dyn Write + Send>, StorageError> {
        Err(StorageError::ReadOnly)
    }

    fn input_stream_unbuffered(&self) -> Result<Box<dyn Read + Send>, StorageError> {
        self.check_live()?;
        self.state.underlying.input_stream_unbuffered()
    }

    fn size(&self) -> u64 {
        self.state.underlying.size()
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn set_read_only(&self) {}

    fn create_shadow(&self) -> Result<Box<dyn Bucket>, StorageError> {
        self.check_live()?;
        self.state.readers.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(ReaderBucket {
            state: Arc::clone(&self.state),
            disposed: AtomicBool::new(false),
        }))
    }

    fn close(&self) {}

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.release();
        }
    }

    fn store_to(&self, _sink: &mut dyn Write) -> Result<(), StorageError> {
        // Shadow views are transient by construction.
        Err(StorageError::NotPersistent)
    }

    fn on_resume(&self, _ctx: &ResumeContext) -> Result<(), StorageError> {
        Ok(())
    }

    fn to_random_access_buffer(
        self: Box<Self>,
    ) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
        Err(StorageError::NotPersistent)
    }
}

impl Drop for ReaderBucket {
    fn drop(&mut self) {
        // Last-resort count release for shadows dropped without dispose.
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{ArrayBucket, read_bucket_to_vec};
    use crate::bucket::FileBucket;
    use tempfile::TempDir;

    fn filled_bucket() -> ArrayBucket {
        let bucket = ArrayBucket::new("shared");
        bucket.output_stream().unwrap().write_all(b"shared bytes").unwrap();
        bucket
    }

    #[test]
    fn readers_share_and_reject_writes() {
        let reader = ReaderBucket::new(Box::new(filled_bucket()));
        let shadow = reader.create_shadow().unwrap();
        assert_eq!(reader.reader_count(), 2);

        assert_eq!(read_bucket_to_vec(&reader).unwrap(), b"shared bytes");
        assert_eq!(read_bucket_to_vec(shadow.as_ref()).unwrap(), b"shared bytes");
        assert!(matches!(
            reader.output_stream_unbuffered(),
            Err(StorageError::ReadOnly)
        ));
    }

    #[test]
    fn last_reference_disposes_underlying() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared");
        let file_bucket = FileBucket::new(&path, true);
        file_bucket.output_stream().unwrap().write_all(b"x").unwrap();

        let reader = ReaderBucket::new(Box::new(file_bucket));
        let shadow = reader.create_shadow().unwrap();

        reader.dispose();
        assert!(path.exists(), "one reader still live");
        shadow.dispose();
        assert!(!path.exists(), "last reader out deletes the file");
    }

    #[test]
    fn leaked_shadow_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared");
        let file_bucket = FileBucket::new(&path, true);
        file_bucket.output_stream().unwrap().write_all(b"x").unwrap();

        let reader = ReaderBucket::new(Box::new(file_bucket));
        {
            let _leaked = reader.create_shadow().unwrap();
            // Dropped without dispose.
        }
        reader.dispose();
        assert!(!path.exists());
    }

    #[test]
    fn disposed_reader_fails_reads() {
        let reader = ReaderBucket::new(Box::new(filled_bucket()));
        reader.dispose();
        assert!(matches!(
            reader.input_stream(),
            Err(StorageError::AlreadyFreed)
        ));
    }
}
