//! Chunk decryption capability.
//!
//! The download core hands every fetched chunk to a [`ChunkDecrypter`] before
//! it reaches the chunk store. Cipher primitives live behind this trait; the
//! crate ships two implementations:
//!
//! - [`PassthroughDecrypter`]: returns the served bytes unchanged
//! - [`VerifyingDecrypter`]: wraps another decrypter and checks the chunk
//!   checksum of the plaintext it produces

mod checksum;

use bytes::Bytes;

use crate::error::DecryptError;
use crate::model::{ChunkDescriptor, KeyBag};

pub use checksum::{chunk_checksum, verify_chunk_checksum, CHECKSUM_TAG_SHA256D};

/// Turns served chunk bytes into plaintext.
pub trait ChunkDecrypter: Send + Sync + 'static {
    /// Decrypt one chunk.
    ///
    /// # Arguments
    ///
    /// * `keybag` - Key material of the backup
    /// * `chunk` - Descriptor of the chunk (key, checksum, length)
    /// * `ciphertext` - Served bytes of exactly this chunk
    fn decrypt(
        &self,
        keybag: &KeyBag,
        chunk: &ChunkDescriptor,
        ciphertext: Bytes,
    ) -> Result<Bytes, DecryptError>;
}

/// Decrypter for chunks served in the clear.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDecrypter;

impl ChunkDecrypter for PassthroughDecrypter {
    fn decrypt(
        &self,
        _keybag: &KeyBag,
        _chunk: &ChunkDescriptor,
        ciphertext: Bytes,
    ) -> Result<Bytes, DecryptError> {
        Ok(ciphertext)
    }
}

/// Decrypter that verifies the chunk checksum after decryption.
#[derive(Debug, Default, Clone)]
pub struct VerifyingDecrypter<D> {
    inner: D,
}

impl<D: ChunkDecrypter> VerifyingDecrypter<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

impl<D: ChunkDecrypter> ChunkDecrypter for VerifyingDecrypter<D> {
    fn decrypt(
        &self,
        keybag: &KeyBag,
        chunk: &ChunkDescriptor,
        ciphertext: Bytes,
    ) -> Result<Bytes, DecryptError> {
        let plaintext = self.inner.decrypt(keybag, chunk, ciphertext)?;
        if !verify_chunk_checksum(&chunk.checksum, &plaintext)? {
            tracing::trace!("Chunk checksum tag not recognised, skipping verification");
        }
        Ok(plaintext)
    }
}
