//! Buckets: sequential append-then-read byte containers.
//!
//! A bucket has at most one writer at a time and any number of readers.
//! Opening a new output stream truncates. Leaves ([`ArrayBucket`],
//! [`FileBucket`], [`NullBucket`]) own the bytes; wrappers
//! ([`PaddedBucket`], [`EncryptedBucket`], [`DelayedDisposeBucket`],
//! [`ReaderBucket`]) compose behaviour and exclusively own their
//! underlying bucket — except the reader bucket, which shares it.

pub mod array;
pub mod delayed;
pub mod encrypted;
pub mod file;
pub mod null;
pub mod padded;
pub mod reader;

use std::io::{self, BufReader, BufWriter, Read, Write};

use crate::error::StorageError;
use crate::rab::RandomAccessBuffer;
use crate::resume::ResumeContext;

/// A sequential byte container.
pub trait Bucket: Send + Sync {
    /// A human-readable name for diagnostics.
    fn name(&self) -> String;

    /// Open the single output stream, truncating existing contents and
    /// resetting `size` to zero. Fails with *writer-open* while a previous
    /// output stream is still live, and *read-only* once
    /// [`set_read_only`](Bucket::set_read_only) has been called.
    fn output_stream_unbuffered(&self) -> Result<Box<dyn Write + Send>, StorageError>;

    /// Buffered variant of
    /// [`output_stream_unbuffered`](Bucket::output_stream_unbuffered).
    fn output_stream(&self) -> Result<Box<dyn Write + Send>, StorageError> {
        Ok(Box::new(BufWriter::new(self.output_stream_unbuffered()?)))
    }

    /// Open an input stream positioned at the start. Any number may be
    /// open at once, each independently positioned.
    fn input_stream_unbuffered(&self) -> Result<Box<dyn Read + Send>, StorageError>;

    /// Buffered variant of
    /// [`input_stream_unbuffered`](Bucket::input_stream_unbuffered).
    fn input_stream(&self) -> Result<Box<dyn Read + Send>, StorageError> {
        Ok(Box::new(BufReader::new(self.input_stream_unbuffered()?)))
    }

    /// Current data size in bytes.
    fn size(&self) -> u64;

    fn is_read_only(&self) -> bool;

    /// Mark read-only. Sticky: there is no way back.
    fn set_read_only(&self);

    /// A read-only view sharing the underlying storage, with its own
    /// reader state.
    fn create_shadow(&self) -> Result<Box<dyn Bucket>, StorageError>;

    /// Close the bucket. Outstanding streams are invalidated on a
    /// best-effort basis.
    fn close(&self);

    /// Dispose of the bucket, deleting backing storage where applicable.
    fn dispose(&self);

    /// Write a magic-tagged reconstruction record.
    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError>;

    /// Re-attach to the runtime after a restart.
    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError>;

    /// Freeze the bucket (marking it read-only) and return a
    /// random-access view of its final bytes.
    fn to_random_access_buffer(
        self: Box<Self>,
    ) -> Result<Box<dyn RandomAccessBuffer>, StorageError>;
}

/// Produces disk-backed buckets on demand. The temp-storage manager's disk
/// factory implements this; the temp bucket asks it for a successor when
/// migrating out of RAM.
pub trait BucketFactory: Send + Sync {
    fn make_bucket(&self) -> Result<Box<dyn Bucket>, StorageError>;
}

/// Copy all of `src` into `dst` through their streams, returning the
/// number of bytes moved.
pub fn copy_bucket(src: &dyn Bucket, dst: &dyn Bucket) -> Result<u64, StorageError> {
    let mut input = src.input_stream()?;
    let mut output = dst.output_stream()?;
    let copied = io::copy(&mut input, &mut output)?;
    output.flush()?;
    Ok(copied)
}

/// Read a bucket's full contents.
pub fn read_bucket_to_vec(bucket: &dyn Bucket) -> Result<Vec<u8>, StorageError> {
    let mut input = bucket.input_stream()?;
    let mut data = Vec::with_capacity(usize::try_from(bucket.size()).unwrap_or(0));
    input.read_to_end(&mut data)?;
    Ok(data)
}

pub use array::ArrayBucket;
pub use delayed::{DelayedDisposeBucket, DelayedDisposeRab};
pub use encrypted::EncryptedBucket;
pub use file::FileBucket;
pub use null::NullBucket;
pub use padded::{PaddedBucket, padded_size};
pub use reader::ReaderBucket;
