//! Chunk checksum calculation and verification.
//!
//! Chunk checksums are served as one algorithm tag byte followed by the
//! digest. Tag [`CHECKSUM_TAG_SHA256D`] is the first 20 bytes of
//! SHA-256(SHA-256(plaintext)).

use sha2::{Digest, Sha256};

use crate::error::DecryptError;

/// Tag byte of the double SHA-256 checksum.
pub const CHECKSUM_TAG_SHA256D: u8 = 0x01;

/// Digest length carried by a [`CHECKSUM_TAG_SHA256D`] checksum.
const SHA256D_DIGEST_LEN: usize = 20;

/// Calculate the tagged checksum of a plaintext chunk.
pub fn chunk_checksum(plaintext: &[u8]) -> Vec<u8> {
    let inner = Sha256::digest(plaintext);
    let outer = Sha256::digest(inner);

    let mut checksum = Vec::with_capacity(1 + SHA256D_DIGEST_LEN);
    checksum.push(CHECKSUM_TAG_SHA256D);
    checksum.extend_from_slice(&outer[..SHA256D_DIGEST_LEN]);
    checksum
}

/// Verify that a plaintext chunk matches its tagged checksum.
///
/// # Returns
///
/// `Ok(true)` if the checksum matches, `Ok(false)` if the tag is not one this
/// module knows how to check, or a [`DecryptError::ChecksumMismatch`].
pub fn verify_chunk_checksum(expected: &[u8], plaintext: &[u8]) -> Result<bool, DecryptError> {
    match expected.first() {
        Some(&CHECKSUM_TAG_SHA256D) => {
            let actual = chunk_checksum(plaintext);
            if actual.as_slice() != expected {
                return Err(DecryptError::ChecksumMismatch {
                    expected: to_hex(expected),
                    actual: to_hex(&actual),
                });
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
