//! Encrypted storage: header format, reopen, and tampering behaviour.
//!
//! The header layout is a wire format: IV, encrypted base key, MAC, then a
//! 4-byte version bitmask and the 8-byte magic. These tests pin it down
//! bit-exactly alongside the behavioural properties (reopen with the same
//! secret, integrity failure on tampering, wrong-secret rejection).

use std::io::Write;

use tempfile::TempDir;

use tempstore_core::StorageError;
use tempstore_core::bucket::{ArrayBucket, Bucket, EncryptedBucket, FileBucket, read_bucket_to_vec};
use tempstore_core::crypto::{CryptoType, HEADER_MAGIC, MasterSecret};
use tempstore_core::rab::{ArrayRab, EncryptedRab, FileRab, RandomAccessBuffer};

// =============================================================================
// Header format
// =============================================================================

#[test]
fn header_lengths_by_type() {
    assert_eq!(CryptoType::ChaCha128.header_len(), 72);
    assert_eq!(CryptoType::ChaCha256.header_len(), 88);
}

#[test]
fn wrapper_size_is_underlying_minus_header() {
    for kind in [CryptoType::ChaCha128, CryptoType::ChaCha256] {
        let master = MasterSecret::random();
        let inner = ArrayRab::new(100 + kind.header_len());
        let enc = EncryptedRab::create(kind, Box::new(inner), &master).unwrap();
        assert_eq!(enc.size(), 100, "{kind:?}");
    }
}

#[test]
fn header_ends_with_version_and_magic() {
    let dir = TempDir::new().unwrap();
    let kind = CryptoType::ChaCha128;
    let master = MasterSecret::random();
    let path = dir.path().join("enc");

    let file = FileRab::create(&path, 100 + kind.header_len() as u64, false).unwrap();
    let enc = EncryptedRab::create(kind, Box::new(file), &master).unwrap();
    enc.close();

    let raw = std::fs::read(&path).unwrap();
    let header = &raw[..kind.header_len()];
    let tail = &header[header.len() - 12..];
    assert_eq!(&tail[..4], &1u32.to_be_bytes(), "version bitmask");
    assert_eq!(&tail[4..], &HEADER_MAGIC.to_be_bytes(), "trailing magic");
}

// =============================================================================
// Reopen and tampering
// =============================================================================

/// Build an encrypted Rab over a file, write "message", close it, and
/// return the path.
fn write_message(dir: &TempDir, master: &MasterSecret) -> std::path::PathBuf {
    let kind = CryptoType::ChaCha128;
    let path = dir.path().join("enc");
    let file = FileRab::create(&path, 100 + kind.header_len() as u64, false).unwrap();
    let enc = EncryptedRab::create(kind, Box::new(file), master).unwrap();
    enc.pwrite(0, b"message").unwrap();
    enc.close();
    path
}

#[test]
fn reopen_with_same_secret_reads_original_data() {
    let dir = TempDir::new().unwrap();
    let master = MasterSecret::random();
    let path = write_message(&dir, &master);

    let reopened = FileRab::open(&path, false).unwrap();
    let enc = EncryptedRab::open(CryptoType::ChaCha128, Box::new(reopened), &master).unwrap();
    assert_eq!(enc.size(), 100);
    let mut buf = [0u8; 7];
    enc.pread(0, &mut buf).unwrap();
    assert_eq!(&buf, b"message");
}

#[test]
fn flipping_byte_after_iv_fails_integrity() {
    let dir = TempDir::new().unwrap();
    let master = MasterSecret::random();
    let path = write_message(&dir, &master);

    // The 13th byte is the first byte after the header IV: part of the
    // encrypted base key.
    let mut raw = std::fs::read(&path).unwrap();
    raw[12] ^= 0x01;
    std::fs::write(&path, &raw).unwrap();

    let reopened = FileRab::open(&path, false).unwrap();
    assert!(matches!(
        EncryptedRab::open(CryptoType::ChaCha128, Box::new(reopened), &master),
        Err(StorageError::Integrity { .. })
    ));
}

#[test]
fn corrupt_magic_fails_integrity() {
    let dir = TempDir::new().unwrap();
    let master = MasterSecret::random();
    let path = write_message(&dir, &master);

    let header_len = CryptoType::ChaCha128.header_len();
    let mut raw = std::fs::read(&path).unwrap();
    raw[header_len - 1] ^= 0xff;
    std::fs::write(&path, &raw).unwrap();

    let reopened = FileRab::open(&path, false).unwrap();
    assert!(matches!(
        EncryptedRab::open(CryptoType::ChaCha128, Box::new(reopened), &master),
        Err(StorageError::Integrity { .. })
    ));
}

#[test]
fn corrupt_mac_region_fails_integrity() {
    let dir = TempDir::new().unwrap();
    let master = MasterSecret::random();
    let path = write_message(&dir, &master);

    // MAC sits between the encrypted key and the version word.
    let kind = CryptoType::ChaCha128;
    let mac_offset = 12 + kind.key_bytes();
    let mut raw = std::fs::read(&path).unwrap();
    raw[mac_offset] ^= 0x80;
    std::fs::write(&path, &raw).unwrap();

    let reopened = FileRab::open(&path, false).unwrap();
    assert!(matches!(
        EncryptedRab::open(kind, Box::new(reopened), &master),
        Err(StorageError::Integrity { .. })
    ));
}

#[test]
fn wrong_secret_fails_integrity() {
    let dir = TempDir::new().unwrap();
    let master = MasterSecret::random();
    let path = write_message(&dir, &master);

    let reopened = FileRab::open(&path, false).unwrap();
    assert!(matches!(
        EncryptedRab::open(CryptoType::ChaCha128, Box::new(reopened), &MasterSecret::random()),
        Err(StorageError::Integrity { .. })
    ));
}

// =============================================================================
// Encrypted buckets
// =============================================================================

#[test]
fn bucket_reopened_over_the_same_file_decrypts() {
    let dir = TempDir::new().unwrap();
    let master = MasterSecret::random();
    let path = dir.path().join("bucket");

    {
        let bucket = EncryptedBucket::new(
            CryptoType::ChaCha256,
            Box::new(FileBucket::new(&path, false)),
            master.clone(),
        );
        bucket
            .output_stream()
            .unwrap()
            .write_all(b"persisted across instances")
            .unwrap();
    }

    let bucket = EncryptedBucket::new(
        CryptoType::ChaCha256,
        Box::new(FileBucket::new(&path, false)),
        master,
    );
    assert_eq!(
        read_bucket_to_vec(&bucket).unwrap(),
        b"persisted across instances"
    );
}

#[test]
fn bucket_and_rab_share_one_header_format() {
    // Data written through the streaming bucket must decrypt through the
    // positional wrapper after conversion.
    let master = MasterSecret::random();
    let bucket = EncryptedBucket::new(
        CryptoType::ChaCha128,
        Box::new(ArrayBucket::new("shared-format")),
        master,
    );
    bucket
        .output_stream()
        .unwrap()
        .write_all(b"one format, two views")
        .unwrap();

    let rab = Box::new(bucket).to_random_access_buffer().unwrap();
    assert_eq!(rab.size(), 21);
    let mut buf = [0u8; 21];
    rab.pread(0, &mut buf).unwrap();
    assert_eq!(&buf, b"one format, two views");

    // And piecemeal, from a non-zero offset.
    let mut tail = [0u8; 9];
    rab.pread(12, &mut tail).unwrap();
    assert_eq!(&tail, b"two views");
}
