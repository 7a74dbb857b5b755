//! Layered temporary storage for a peer-to-peer node: byte-addressable
//! buffers and sequential buckets with transparent RAM/disk placement,
//! authenticated encryption, length-hiding padding, file-descriptor
//! pooling, shadow views, delayed disposal and restart recovery.
//!
//! The two core abstractions are [`RandomAccessBuffer`] (fixed-size,
//! positional I/O) and [`Bucket`] (append-then-read). The
//! [`TempStorageManager`] composes leaves and wrappers according to
//! policy and hands them back behind those traits.

pub mod bucket;
pub mod crypto;
pub mod error;
pub mod rab;
pub mod resume;
pub mod temp;

pub use bucket::{Bucket, BucketFactory};
pub use crypto::{CryptoType, MasterSecret};
pub use error::StorageError;
pub use rab::{FdPool, RabFactory, RabLock, RandomAccessBuffer};
pub use resume::{
    DelayedDisposable, PersistentFileTracker, ResumeContext, restore_bucket_from, restore_rab_from,
};
pub use temp::{TempStorageConfig, TempStorageManager};
