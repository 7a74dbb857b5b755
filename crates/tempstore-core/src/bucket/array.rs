//! Pure-memory bucket.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::bucket::Bucket;
use crate::error::StorageError;
use crate::rab::{ArrayRab, RandomAccessBuffer};
use crate::resume::{ResumeContext, codec, magic};

/// A bucket backed by a growable in-memory vector.
pub struct ArrayBucket {
    inner: Arc<ArrayInner>,
}

struct ArrayInner {
    name: String,
    data: RwLock<Vec<u8>>,
    read_only: AtomicBool,
    writer_open: AtomicBool,
    closed: AtomicBool,
    disposed: AtomicBool,
}

impl ArrayBucket {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ArrayBucket::from_vec(name, Vec::new())
    }

    #[must_use]
    pub fn from_vec(name: impl Into<String>, data: Vec<u8>) -> Self {
        ArrayBucket {
            inner: Arc::new(ArrayInner {
                name: name.into(),
                data: RwLock::new(data),
                read_only: AtomicBool::new(false),
                writer_open: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn restore(reader: &mut dyn Read) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::ARRAY_BUCKET_VERSION, "array bucket")?;
        let size = codec::read_u64(reader)?;
        let mut data = vec![
            0u8;
            usize::try_from(size).map_err(|_| StorageError::ResumeFailed {
                reason: format!("array bucket of {size} bytes does not fit in memory"),
            })?
        ];
        codec::read_exact(reader, &mut data)?;
        Ok(ArrayBucket::from_vec("restored", data))
    }

    /// Move the contents out (or copy, if streams still reference them).
    pub(crate) fn take_data(self) -> Vec<u8> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.data.into_inner().expect("lock poisoned"),
            Err(shared) => shared.data.read().expect("lock poisoned").clone(),
        }
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

impl Bucket for ArrayBucket {
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn output_stream_unbuffered(&self) -> Result<Box<dyn Write + Send>, StorageError> {
        self.check_live()?;
        if self.inner.read_only.load(Ordering::Acquire) {
            return Err(StorageError::ReadOnly);
        }
        if self.inner.writer_open.swap(true, Ordering::AcqRel) {
            return Err(StorageError::WriterOpen);
        }
        self.inner.data.write().expect("lock poisoned").clear();
        Ok(Box::new(ArrayBucketWriter {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn input_stream_unbuffered(&self) -> Result<Box<dyn Read + Send>, StorageError> {
        self.check_live()?;
        Ok(Box::new(ArrayBucketReader {
            inner: Arc::clone(&self.inner),
            pos: 0,
        }))
    }

    fn size(&self) -> u64 {
        self.inner.data.read().expect("lock poisoned").len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Acquire)
    }

    fn set_read_only(&self) {
        self.inner.read_only.store(true, Ordering::Release);
    }

    fn create_shadow(&self) -> Result<Box<dyn Bucket>, StorageError> {
        self.check_live()?;
        // Memory is cheap to copy; the shadow is fully independent.
        let copy = self.inner.data.read().expect("lock poisoned").clone();
        let shadow = ArrayBucket::from_vec(self.inner.name.clone(), copy);
        shadow.set_read_only();
        Ok(Box::new(shadow))
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn dispose(&self) {
        self.close();
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            let mut data = self.inner.data.write().expect("lock poisoned");
            data.clear();
            data.shrink_to_fit();
        }
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        self.check_live()?;
        codec::write_u32(sink, magic::ARRAY_BUCKET)?;
        codec::write_u32(sink, magic::ARRAY_BUCKET_VERSION)?;
        let data = self.inner.data.read().expect("lock poisoned");
        codec::write_u64(sink, data.len() as u64)?;
        sink.write_all(&data).map_err(StorageError::from)?;
        Ok(())
    }

    fn on_resume(&self, _ctx: &ResumeContext) -> Result<(), StorageError> {
        Ok(())
    }

    fn to_random_access_buffer(
        self: Box<Self>,
    ) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
        self.check_live()?;
        self.set_read_only();
        Ok(Box::new(ArrayRab::from_vec_read_only((*self).take_data())))
    }
}

struct ArrayBucketWriter {
    inner: Arc<ArrayInner>,
}

impl Write for ArrayBucketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.disposed.load(Ordering::Acquire) || self.inner.closed.load(Ordering::Acquire)
        {
            return Err(io::Error::other("bucket is closed"));
        }
        self.inner
            .data
            .write()
            .expect("lock poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ArrayBucketWriter {
    fn drop(&mut self) {
        self.inner.writer_open.store(false, Ordering::Release);
    }
}

struct ArrayBucketReader {
    inner: Arc<ArrayInner>,
    pos: usize,
}

impl Read for ArrayBucketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(io::Error::other("bucket has been freed"));
        }
        let data = self.inner.data.read().expect("lock poisoned");
        let available = data.len().saturating_sub(self.pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::read_bucket_to_vec;

    #[test]
    fn write_then_read() {
        let bucket = ArrayBucket::new("t");
        {
            let mut out = bucket.output_stream().unwrap();
            out.write_all(b"hello world").unwrap();
            out.flush().unwrap();
        }
        assert_eq!(bucket.size(), 11);
        assert_eq!(read_bucket_to_vec(&bucket).unwrap(), b"hello world");
    }

    #[test]
    fn reopen_truncates() {
        let bucket = ArrayBucket::new("t");
        bucket.output_stream().unwrap().write_all(b"abc").unwrap();
        assert_eq!(bucket.size(), 3);
        let out = bucket.output_stream().unwrap();
        assert_eq!(bucket.size(), 0);
        drop(out);
    }

    #[test]
    fn single_writer_enforced() {
        let bucket = ArrayBucket::new("t");
        let first = bucket.output_stream_unbuffered().unwrap();
        assert!(matches!(
            bucket.output_stream_unbuffered(),
            Err(StorageError::WriterOpen)
        ));
        drop(first);
        assert!(bucket.output_stream_unbuffered().is_ok());
    }

    #[test]
    fn read_only_is_sticky() {
        let bucket = ArrayBucket::new("t");
        bucket.set_read_only();
        assert!(bucket.is_read_only());
        assert!(matches!(
            bucket.output_stream_unbuffered(),
            Err(StorageError::ReadOnly)
        ));
    }

    #[test]
    fn converts_to_rab() {
        let bucket = ArrayBucket::new("t");
        bucket.output_stream().unwrap().write_all(b"rab me").unwrap();
        let rab = Box::new(bucket).to_random_access_buffer().unwrap();
        let mut buf = [0u8; 6];
        rab.pread(0, &mut buf).unwrap();
        assert_eq!(&buf, b"rab me");
        assert!(matches!(rab.pwrite(0, &[0]), Err(StorageError::ReadOnly)));
    }

    #[test]
    fn disposed_reads_fail() {
        let bucket = ArrayBucket::new("t");
        bucket.output_stream().unwrap().write_all(b"x").unwrap();
        let mut reader = bucket.input_stream().unwrap();
        bucket.dispose();
        let mut buf = [0u8; 1];
        assert!(reader.read(&mut buf).is_err());
    }
}
