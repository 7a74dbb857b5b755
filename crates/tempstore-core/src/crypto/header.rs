//! The bit-exact encryption header shared by the encrypted Rab and bucket
//! wrappers.
//!
//! Layout on disk, in order:
//!
//! ```text
//! +----------------+------------------------+----------+--------+----------+
//! | IV_hdr (12)    | encrypted base key     | MAC (32) | ver(4) | magic(8) |
//! |                | (16 or 32)             |          |  be    |  be      |
//! +----------------+------------------------+----------+--------+----------+
//! ```
//!
//! The base key is a per-object random key, encrypted under a key derived
//! from the master secret using `IV_hdr`. The MAC covers
//! `IV_hdr ‖ base_key ‖ ver` so that recovering the wrong base key (wrong
//! secret, flipped ciphertext byte) is always detected.

use rand::RngCore;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use super::cipher::{SeekableCipher, gen_mac, verify_mac};
use super::secret::{MasterSecret, derive_labelled};
use super::CryptoError;

/// 8-byte big-endian constant closing every encryption header.
pub const HEADER_MAGIC: u64 = 0x2c158a6c7772acd3;

/// Scope string for deriving the data cipher's key and IV from the base
/// key. Shared between the Rab and bucket wrappers so a bucket converted to
/// a Rab keeps decrypting with the same parameters.
const DATA_KEY_SCOPE: &str = "tempstore.EncryptedStorage";

const UNDERLYING_KEY_LABEL: &str = "UNDERLYING_KEY";
const UNDERLYING_IV_LABEL: &str = "UNDERLYING_IV";

/// The two defined encryption types. They differ in the length of the base
/// key stored in the header (and therefore in header length); both drive
/// ChaCha20 through the 32-byte labelled-KDF output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoType {
    ChaCha128,
    ChaCha256,
}

impl CryptoType {
    /// Version bitmask written to (and expected in) the header.
    #[must_use]
    pub const fn bitmask(self) -> u32 {
        match self {
            CryptoType::ChaCha128 => 1,
            CryptoType::ChaCha256 => 2,
        }
    }

    /// Stored base-key length in bytes.
    #[must_use]
    pub const fn key_bytes(self) -> usize {
        match self {
            CryptoType::ChaCha128 => 16,
            CryptoType::ChaCha256 => 32,
        }
    }

    #[must_use]
    pub const fn iv_bytes(self) -> usize {
        12
    }

    #[must_use]
    pub const fn mac_bytes(self) -> usize {
        32
    }

    /// Total header length: 12 bytes of version + magic, plus key, IV and
    /// MAC. 72 for [`CryptoType::ChaCha128`], 88 for
    /// [`CryptoType::ChaCha256`].
    #[must_use]
    pub const fn header_len(self) -> usize {
        12 + self.key_bytes() + self.iv_bytes() + self.mac_bytes()
    }

    #[must_use]
    pub fn from_bitmask(bitmask: u32) -> Option<Self> {
        match bitmask {
            1 => Some(CryptoType::ChaCha128),
            2 => Some(CryptoType::ChaCha256),
            _ => None,
        }
    }

    /// Key-type label used to scope header-key derivation.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            CryptoType::ChaCha128 => "CHACHA_128",
            CryptoType::ChaCha256 => "CHACHA_256",
        }
    }

    fn header_encrypt_label(self) -> Vec<u8> {
        [b"HEADER_ENCRYPT:", self.label().as_bytes()].concat()
    }

    fn header_mac_label(self) -> Vec<u8> {
        [b"HEADER_MAC:", self.label().as_bytes()].concat()
    }
}

/// A parsed (or freshly created) encryption header: the type, the header
/// IV, and the recovered base key.
pub struct StorageHeader {
    kind: CryptoType,
    iv: [u8; 12],
    base_key: Zeroizing<Vec<u8>>,
}

impl StorageHeader {
    /// Create a new header with a random IV and base key, returning the
    /// parsed form together with its encoded bytes.
    #[must_use]
    pub fn create(kind: CryptoType, master: &MasterSecret) -> (Self, Vec<u8>) {
        let mut iv = [0u8; 12];
        rand::rng().fill_bytes(&mut iv);
        let mut base_key = Zeroizing::new(vec![0u8; kind.key_bytes()]);
        rand::rng().fill_bytes(&mut base_key);

        let header = StorageHeader { kind, iv, base_key };
        let bytes = header.encode(master);
        (header, bytes)
    }

    /// Parse and verify `bytes` as a header of the given type.
    ///
    /// Verifies the trailing magic, the version bitmask, then decrypts the
    /// base key and checks the MAC in constant time. Any failure means the
    /// stored data must not be trusted.
    #[instrument(level = "debug", skip(bytes, master), fields(kind = ?kind))]
    pub fn parse(
        bytes: &[u8],
        kind: CryptoType,
        master: &MasterSecret,
    ) -> Result<Self, CryptoError> {
        let header_len = kind.header_len();
        if bytes.len() < header_len {
            return Err(CryptoError::TruncatedHeader {
                expected: header_len,
                actual: bytes.len(),
            });
        }

        let key_len = kind.key_bytes();
        let iv: [u8; 12] = bytes[..12].try_into().expect("12-byte slice");
        let enc_key = &bytes[12..12 + key_len];
        let mac = &bytes[12 + key_len..12 + key_len + kind.mac_bytes()];
        let ver_off = header_len - 12;
        let ver = u32::from_be_bytes(bytes[ver_off..ver_off + 4].try_into().expect("4 bytes"));
        let magic = u64::from_be_bytes(
            bytes[header_len - 8..header_len]
                .try_into()
                .expect("8 bytes"),
        );

        if magic != HEADER_MAGIC {
            warn!(actual = magic, "bad header magic");
            return Err(CryptoError::BadMagic {
                expected: HEADER_MAGIC,
                actual: magic,
            });
        }
        if ver != kind.bitmask() {
            warn!(bitmask = ver, "unexpected header version bitmask");
            return Err(CryptoError::UnsupportedVersion(ver));
        }

        // Recover the base key, then authenticate IV ‖ base_key ‖ ver.
        let hdr_enc_key = master.derive_key(&kind.header_encrypt_label());
        let mut base_key = Zeroizing::new(enc_key.to_vec());
        SeekableCipher::new(&hdr_enc_key, &iv).apply(&mut base_key);

        let hdr_mac_key = master.derive_key(&kind.header_mac_label());
        if !verify_mac(
            mac,
            hdr_mac_key.as_ref(),
            &[&iv, &base_key, &ver.to_be_bytes()],
        ) {
            warn!("header MAC mismatch");
            return Err(CryptoError::MacVerificationFailed);
        }

        debug!("encryption header verified");
        Ok(StorageHeader { kind, iv, base_key })
    }

    fn encode(&self, master: &MasterSecret) -> Vec<u8> {
        let kind = self.kind;
        let hdr_enc_key = master.derive_key(&kind.header_encrypt_label());
        let mut enc_key = self.base_key.clone();
        SeekableCipher::new(&hdr_enc_key, &self.iv).apply(&mut enc_key);

        let ver = kind.bitmask();
        let hdr_mac_key = master.derive_key(&kind.header_mac_label());
        let mac = gen_mac(
            hdr_mac_key.as_ref(),
            &[&self.iv, &self.base_key, &ver.to_be_bytes()],
        );

        let mut out = Vec::with_capacity(kind.header_len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&enc_key);
        out.extend_from_slice(&mac[..kind.mac_bytes()]);
        out.extend_from_slice(&ver.to_be_bytes());
        out.extend_from_slice(&HEADER_MAGIC.to_be_bytes());
        out
    }

    #[must_use]
    pub fn kind(&self) -> CryptoType {
        self.kind
    }

    /// Build a fresh data cipher positioned at stream offset zero.
    #[must_use]
    pub fn data_cipher(&self) -> SeekableCipher {
        let key = derive_labelled(&self.base_key, DATA_KEY_SCOPE, UNDERLYING_KEY_LABEL);
        let iv_full = derive_labelled(&self.base_key, DATA_KEY_SCOPE, UNDERLYING_IV_LABEL);
        let iv: [u8; 12] = iv_full[..12].try_into().expect("12-byte slice");
        SeekableCipher::new(&key, &iv)
    }
}
