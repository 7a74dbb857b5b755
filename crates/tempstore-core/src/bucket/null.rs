//! A bucket that swallows writes and reads back nothing. Useful where a
//! sink is required but the data is irrelevant.

use std::io::{self, Read, Write};

use crate::bucket::Bucket;
use crate::error::StorageError;
use crate::rab::{ArrayRab, RandomAccessBuffer};
use crate::resume::{ResumeContext, codec, magic};

#[derive(Default)]
pub struct NullBucket;

impl NullBucket {
    #[must_use]
    pub fn new() -> Self {
        NullBucket
    }

    pub(crate) fn restore(reader: &mut dyn Read) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::NULL_BUCKET_VERSION, "null bucket")?;
        Ok(NullBucket)
    }
}

impl Bucket for NullBucket {
    fn name(&self) -> String {
        "null".to_string()
    }

    fn output_stream_unbuffered(&self) -> Result<Box<dyn Write + Send>, StorageError> {
        Ok(Box::new(io::sink()))
    }

    fn input_stream_unbuffered(&self) -> Result<Box<dyn Read + Send>, StorageError> {
        Ok(Box::new(io::empty()))
    }

    fn size(&self) -> u64 {
        0
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn set_read_only(&self) {}

    fn create_shadow(&self) -> Result<Box<dyn Bucket>, StorageError> {
        Ok(Box::new(NullBucket))
    }

    fn close(&self) {}

    fn dispose(&self) {}

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        codec::write_u32(sink, magic::NULL_BUCKET)?;
        codec::write_u32(sink, magic::NULL_BUCKET_VERSION)?;
        Ok(())
    }

    fn on_resume(&self, _ctx: &ResumeContext) -> Result<(), StorageError> {
        Ok(())
    }

    fn to_random_access_buffer(
        self: Box<Self>,
    ) -> Result<Box<dyn RandomAccessBuffer>, StorageError> {
        Ok(Box::new(ArrayRab::from_vec_read_only(Vec::new())))
    }
}
