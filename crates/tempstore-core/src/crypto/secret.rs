//! Master secret and labelled key derivation.
//!
//! All per-object keys descend from a single long-lived 32-byte master
//! secret. Header keys are derived directly from it; data-cipher keys are
//! derived from the per-object base key with a scope + label pair so that
//! distinct uses of one base key cannot collide.

use std::fmt;

use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Long-lived secret from which per-object header-encryption and MAC keys
/// are derived.
///
/// Stored behind [`SecretBox`] so the bytes are zeroed on drop and cannot be
/// accidentally logged; access goes through the scoped [`with_secret`]
/// method.
///
/// [`with_secret`]: MasterSecret::with_secret
pub struct MasterSecret {
    inner: SecretBox<[u8; 32]>,
}

impl MasterSecret {
    /// Generate a fresh random master secret.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = Box::new([0u8; 32]);
        rand::rng().fill_bytes(bytes.as_mut());
        MasterSecret {
            inner: SecretBox::new(bytes),
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MasterSecret {
            inner: SecretBox::new(Box::new(bytes)),
        }
    }

    /// Execute a function with access to the raw secret. The secret never
    /// escapes the callback.
    pub fn with_secret<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        f(self.inner.expose_secret())
    }

    /// Derive a 32-byte key from the master secret for the given purpose
    /// label.
    #[must_use]
    pub(crate) fn derive_key(&self, label: &[u8]) -> Zeroizing<[u8; 32]> {
        self.with_secret(|secret| hmac_derive(secret, &[label]))
    }
}

impl Clone for MasterSecret {
    fn clone(&self) -> Self {
        MasterSecret::from_bytes(*self.inner.expose_secret())
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterSecret")
            .field("inner", &"[REDACTED]")
            .finish()
    }
}

/// Derive 32 bytes of key material from `base_key`, scoped by the consuming
/// wrapper's type identity and a use label (`"UNDERLYING_KEY"`,
/// `"UNDERLYING_IV"`).
#[must_use]
pub(crate) fn derive_labelled(base_key: &[u8], scope: &str, label: &str) -> Zeroizing<[u8; 32]> {
    hmac_derive(base_key, &[scope.as_bytes(), &[0u8], label.as_bytes()])
}

fn hmac_derive(key: &[u8], parts: &[&[u8]]) -> Zeroizing<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let secret = MasterSecret::random();
        let debug = format!("{secret:?}");
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn derivation_is_deterministic() {
        let secret = MasterSecret::from_bytes([7u8; 32]);
        assert_eq!(
            *secret.derive_key(b"HEADER_MAC:CHACHA_256"),
            *secret.derive_key(b"HEADER_MAC:CHACHA_256"),
        );
        assert_ne!(
            *secret.derive_key(b"HEADER_MAC:CHACHA_256"),
            *secret.derive_key(b"HEADER_ENCRYPT:CHACHA_256"),
        );
    }

    #[test]
    fn labelled_derivation_separates_scopes_and_labels() {
        let base = [3u8; 16];
        let a = derive_labelled(&base, "scope.a", "UNDERLYING_KEY");
        let b = derive_labelled(&base, "scope.b", "UNDERLYING_KEY");
        let c = derive_labelled(&base, "scope.a", "UNDERLYING_IV");
        assert_ne!(*a, *b);
        assert_ne!(*a, *c);
    }
}
