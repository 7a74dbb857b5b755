//! Seekable stream cipher and MAC helpers.

use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// A ChaCha20 instance that tracks its own stream position.
///
/// Encrypted storage keeps one instance per direction; successive
/// sequential operations amortize to a no-op seek.
pub struct SeekableCipher {
    inner: ChaCha20,
}

impl SeekableCipher {
    #[must_use]
    pub fn new(key: &[u8; 32], iv: &[u8; 12]) -> Self {
        SeekableCipher {
            inner: ChaCha20::new(key.into(), iv.into()),
        }
    }

    /// Current keystream position in bytes.
    #[must_use]
    pub fn position(&mut self) -> u64 {
        self.inner.current_pos()
    }

    /// Reposition the keystream. Seeking is cheap in either direction; the
    /// block counter is recomputed rather than skipped through.
    pub fn seek_to(&mut self, pos: u64) {
        self.inner.seek(pos);
    }

    /// XOR the keystream into `data` (encrypts and decrypts alike),
    /// advancing the position by `data.len()`.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

/// `HMAC-SHA-256(key, parts[0] ‖ parts[1] ‖ …)`.
#[must_use]
pub fn gen_mac(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of `expected` against a freshly computed MAC
/// over `parts`. `expected` may be a truncation of the full 32-byte tag.
#[must_use]
pub fn verify_mac(expected: &[u8], key: &[u8], parts: &[&[u8]]) -> bool {
    let computed = gen_mac(key, parts);
    if expected.is_empty() || expected.len() > computed.len() {
        return false;
    }
    computed[..expected.len()].ct_eq(expected).into()
}
