//! Authenticated encryption over a random-access buffer.
//!
//! The first `header_len` bytes of the underlying buffer hold the
//! encryption header (see [`crate::crypto::header`]); everything after is
//! stream-cipher ciphertext of the logical contents. One cipher instance
//! is kept per direction so sequential reads and sequential writes skip
//! nothing.

use std::io::Write;
use std::sync::Mutex;

use tracing::instrument;
use zeroize::Zeroizing;

use crate::crypto::{CryptoType, MasterSecret, SeekableCipher, StorageHeader};
use crate::error::StorageError;
use crate::rab::{RabLock, RandomAccessBuffer, check_range};
use crate::resume::{ResumeContext, codec, magic};

pub struct EncryptedRab {
    inner: Box<dyn RandomAccessBuffer>,
    kind: CryptoType,
    read_cipher: Mutex<SeekableCipher>,
    write_cipher: Mutex<SeekableCipher>,
}

impl EncryptedRab {
    /// Set up encryption over a fresh underlying buffer: generates a new
    /// header and writes it to bytes `[0, header_len)`.
    #[instrument(level = "debug", skip(inner, master), fields(kind = ?kind, underlying = inner.size()))]
    pub fn create(
        kind: CryptoType,
        inner: Box<dyn RandomAccessBuffer>,
        master: &MasterSecret,
    ) -> Result<Self, StorageError> {
        let header_len = kind.header_len() as u64;
        if inner.size() < header_len {
            return Err(StorageError::OutOfRange {
                offset: 0,
                len: header_len,
                size: inner.size(),
            });
        }
        let (header, bytes) = StorageHeader::create(kind, master);
        inner.pwrite(0, &bytes)?;
        Ok(Self::assemble(kind, inner, &header))
    }

    /// Attach to an existing underlying buffer: reads and verifies the
    /// header, failing with an integrity error on any mismatch.
    #[instrument(level = "debug", skip(inner, master), fields(kind = ?kind))]
    pub fn open(
        kind: CryptoType,
        inner: Box<dyn RandomAccessBuffer>,
        master: &MasterSecret,
    ) -> Result<Self, StorageError> {
        let header_len = kind.header_len();
        if inner.size() < header_len as u64 {
            return Err(StorageError::Integrity {
                reason: format!(
                    "underlying storage of {} bytes cannot hold a {header_len}-byte header",
                    inner.size()
                ),
            });
        }
        let mut bytes = vec![0u8; header_len];
        inner.pread(0, &mut bytes)?;
        let header = StorageHeader::parse(&bytes, kind, master)?;
        Ok(Self::assemble(kind, inner, &header))
    }

    fn assemble(kind: CryptoType, inner: Box<dyn RandomAccessBuffer>, header: &StorageHeader) -> Self {
        EncryptedRab {
            inner,
            kind,
            read_cipher: Mutex::new(header.data_cipher()),
            write_cipher: Mutex::new(header.data_cipher()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> CryptoType {
        self.kind
    }

    fn header_len(&self) -> u64 {
        self.kind.header_len() as u64
    }

    pub(crate) fn restore(
        reader: &mut dyn std::io::Read,
        ctx: &ResumeContext,
    ) -> Result<Self, StorageError> {
        codec::check_version(reader, magic::ENCRYPTED_RAB_VERSION, "encrypted wrapper")?;
        let bitmask = codec::read_u32(reader)?;
        let kind = CryptoType::from_bitmask(bitmask).ok_or_else(|| StorageError::StorageFormat {
            reason: format!("unknown encryption type bitmask {bitmask:#x}"),
        })?;
        let inner = crate::resume::restore_rab_from(reader, ctx)?;
        let master = ctx.master_secret().ok_or_else(|| StorageError::ResumeFailed {
            reason: "encrypted storage requires a master secret to resume".to_string(),
        })?;
        EncryptedRab::open(kind, inner, master)
    }
}

impl RandomAccessBuffer for EncryptedRab {
    fn size(&self) -> u64 {
        self.inner.size() - self.header_len()
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.size())?;
        self.inner.pread(offset + self.header_len(), buf)?;
        let mut cipher = self.read_cipher.lock().expect("lock poisoned");
        if cipher.position() != offset {
            cipher.seek_to(offset);
        }
        cipher.apply(buf);
        Ok(())
    }

    fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        check_range(offset, buf.len(), self.size())?;
        let mut ciphertext = Zeroizing::new(buf.to_vec());
        {
            let mut cipher = self.write_cipher.lock().expect("lock poisoned");
            if cipher.position() != offset {
                cipher.seek_to(offset);
            }
            cipher.apply(&mut ciphertext);
        }
        self.inner.pwrite(offset + self.header_len(), &ciphertext)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn dispose(&self) {
        self.inner.dispose();
    }

    fn lock_open(&self) -> Result<RabLock, StorageError> {
        self.inner.lock_open()
    }

    fn store_to(&self, sink: &mut dyn Write) -> Result<(), StorageError> {
        codec::write_u32(sink, magic::ENCRYPTED_RAB)?;
        codec::write_u32(sink, magic::ENCRYPTED_RAB_VERSION)?;
        codec::write_u32(sink, self.kind.bitmask())?;
        self.inner.store_to(sink)
    }

    fn on_resume(&self, ctx: &ResumeContext) -> Result<(), StorageError> {
        self.inner.on_resume(ctx)
    }
}
