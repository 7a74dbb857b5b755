//! Temp storage: the manager, the RAM tracker, the RAM→disk bucket, the
//! filename generator and the disk-space floor.

pub mod bucket;
pub mod diskspace;
pub mod filename;
pub mod manager;
pub mod tracker;

pub use bucket::TempBucket;
pub use diskspace::{CheckedBucket, CheckedWriter, DiskSpaceChecker, usable_space};
pub use filename::FilenameGenerator;
pub use manager::{
    Executor, MAX_USAGE_HIGH, MAX_USAGE_LOW, RAM_CONVERSION_FACTOR, RAM_STORAGE_MAX_AGE,
    TempStorageConfig, TempStorageManager, WorkerExecutor,
};
pub use tracker::{TempRamTracker, TempStorage};
