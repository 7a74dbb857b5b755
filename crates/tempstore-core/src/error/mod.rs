//! Error types for the storage engine.
//!
//! The central sum type is [`StorageError`]; crypto-internal failures use
//! [`CryptoError`](crate::crypto::CryptoError) and are folded into
//! [`StorageError::Integrity`] at the wrapper boundary.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

pub use crate::crypto::CryptoError;

/// Context attached to I/O errors, identifying the operation and the
/// offsets involved.
#[derive(Debug, Clone, Default)]
pub struct IoContext {
    /// The operation that failed (e.g. `"pread"`, `"migrate"`).
    pub operation: Option<&'static str>,
    /// The backing path, if the storage is file-backed.
    pub path: Option<PathBuf>,
    /// The byte offset of the failed operation.
    pub offset: Option<u64>,
    /// The requested length in bytes.
    pub len: Option<u64>,
}

impl IoContext {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        IoContext {
            operation: Some(operation),
            ..IoContext::default()
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn with_len(mut self, len: u64) -> Self {
        self.len = Some(len);
        self
    }
}

impl fmt::Display for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(op) = self.operation {
            parts.push(op.to_string());
        }
        if let Some(offset) = self.offset {
            parts.push(format!("at offset {offset}"));
        }
        if let Some(len) = self.len {
            parts.push(format!("length {len}"));
        }
        if let Some(ref path) = self.path {
            parts.push(format!("on {}", path.display()));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Errors raised by buckets, random-access buffers and the temp-storage
/// manager.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Position or length outside `[0, size]`. Caller bug; not recoverable
    /// at this layer.
    #[error("offset {offset} + length {len} out of range for size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// Operation on a closed object.
    #[error("storage is closed")]
    Closed,

    /// Operation on a disposed object.
    #[error("storage has already been freed")]
    AlreadyFreed,

    /// Write attempted on a read-only object.
    #[error("storage is read-only")]
    ReadOnly,

    /// A second output stream was requested while one is still open.
    #[error("an output stream is already open")]
    WriterOpen,

    /// Underlying OS or channel error, wrapped with context.
    #[error("I/O error {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: IoContext,
    },

    /// The disk-space floor would be violated by this allocation or write.
    #[error(
        "insufficient disk space: requested {requested} bytes with a floor of {floor}, only {usable} usable"
    )]
    InsufficientDiskSpace {
        requested: u64,
        usable: u64,
        floor: u64,
    },

    /// MAC mismatch or bad magic in an encrypted header. The data must not
    /// be trusted.
    #[error("integrity check failed: {reason}")]
    Integrity { reason: String },

    /// Unrecognised magic or version during resume.
    #[error("unrecognised storage format: {reason}")]
    StorageFormat { reason: String },

    /// A referenced file is missing or has the wrong length at resume time.
    #[error("resume failed: {reason}")]
    ResumeFailed { reason: String },

    /// The object cannot write a reconstruction record (e.g. a shadow view).
    #[error("storage cannot be persisted")]
    NotPersistent,
}

impl StorageError {
    /// Create an I/O error with context.
    #[must_use]
    pub fn io(source: io::Error, context: IoContext) -> Self {
        StorageError::Io { source, context }
    }

    /// True for the *insufficient-disk-space* class, which the internal
    /// releaser retries.
    #[must_use]
    pub fn is_disk_space(&self) -> bool {
        matches!(self, StorageError::InsufficientDiskSpace { .. })
    }
}

impl From<io::Error> for StorageError {
    fn from(source: io::Error) -> Self {
        StorageError::Io {
            source,
            context: IoContext::default(),
        }
    }
}

impl From<CryptoError> for StorageError {
    fn from(err: CryptoError) -> Self {
        StorageError::Integrity {
            reason: err.to_string(),
        }
    }
}

/// Map a [`StorageError`] into an [`io::Error`] for use inside
/// `Read`/`Write` implementations, preserving the disk-space class as
/// [`io::ErrorKind::StorageFull`].
#[must_use]
pub fn to_io_error(err: StorageError) -> io::Error {
    match err {
        StorageError::Io { source, .. } => source,
        e if e.is_disk_space() => io::Error::new(io::ErrorKind::StorageFull, e.to_string()),
        e => io::Error::other(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_context_display_empty() {
        let context = IoContext::default();
        assert_eq!(format!("{context}"), "(no context)");
    }

    #[test]
    fn io_context_display_full() {
        let context = IoContext::new("pread")
            .with_offset(4096)
            .with_len(128)
            .with_path("/tmp/t");
        let display = format!("{context}");
        assert!(display.contains("pread"));
        assert!(display.contains("at offset 4096"));
        assert!(display.contains("length 128"));
        assert!(display.contains("/tmp/t"));
    }

    #[test]
    fn disk_space_class() {
        let err = StorageError::InsufficientDiskSpace {
            requested: 10,
            usable: 5,
            floor: 100,
        };
        assert!(err.is_disk_space());
        assert!(!StorageError::Closed.is_disk_space());
        assert_eq!(
            to_io_error(err).kind(),
            std::io::ErrorKind::StorageFull
        );
    }
}
