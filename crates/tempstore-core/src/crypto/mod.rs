//! Cryptographic support for the encrypted storage wrappers: master-secret
//! handling, labelled key derivation, the seekable stream cipher, and the
//! bit-exact encryption header.

pub mod cipher;
pub mod header;
pub mod secret;

use thiserror::Error;

/// Errors from header parsing and verification.
///
/// MAC and magic failures indicate potential **adversarial tampering** (or a
/// wrong master secret, which is cryptographically indistinguishable); the
/// stored data must not be trusted.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Header MAC verification failed.
    #[error("header MAC verification failed - tampering or wrong master secret")]
    MacVerificationFailed,

    /// The trailing magic does not match the header constant.
    #[error("bad header magic: expected {expected:#018x}, got {actual:#018x}")]
    BadMagic { expected: u64, actual: u64 },

    /// The version bitmask names no known encryption type, or does not match
    /// the type this storage was opened as.
    #[error("unsupported header version bitmask {0:#010x}")]
    UnsupportedVersion(u32),

    /// The underlying storage is shorter than a full header.
    #[error("header too short: expected {expected} bytes, got {actual}")]
    TruncatedHeader { expected: usize, actual: usize },
}

pub use cipher::SeekableCipher;
pub use header::{CryptoType, HEADER_MAGIC, StorageHeader};
pub use secret::MasterSecret;
