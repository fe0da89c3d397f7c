//! Authenticated-encryption primitives used by encrypted fields and keysets.
//!
//! This module has no knowledge of keysets or configuration. It exposes the
//! two primitive traits the rest of the crate programs against, plus the
//! AES-GCM-SIV constructions that back them.
//!
//! # Ciphertext format
//!
//! ```text
//! nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```
//!
//! Keyset-level wrappers prepend a 5-byte key prefix; see [`crate::keyset`].

pub mod cipher;

pub use cipher::{AesGcmSivAead, CipherError, SivDeterministicAead, NONCE_LEN, SIV_KEY_LEN, TAG_LEN};

use common::KeysetError;

/// Randomised authenticated encryption with associated data.
///
/// Also the shape of a master key: anything that can wrap and unwrap a keyset
/// (a local key, a KMS client adapter) implements this trait.
#[cfg_attr(test, mockall::automock)]
pub trait Aead: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, KeysetError>;
    fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, KeysetError>;
}

/// Deterministic authenticated encryption: equal inputs give equal ciphertexts.
pub trait DeterministicAead: Send + Sync {
    fn encrypt_deterministically(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, KeysetError>;

    fn decrypt_deterministically(
        &self,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, KeysetError>;
}

impl Aead for AesGcmSivAead {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, KeysetError> {
        Ok(self.seal(plaintext, associated_data)?)
    }

    fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, KeysetError> {
        Ok(self.open(ciphertext, associated_data)?)
    }
}

impl DeterministicAead for SivDeterministicAead {
    fn encrypt_deterministically(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, KeysetError> {
        Ok(self.seal(plaintext, associated_data)?)
    }

    fn decrypt_deterministically(
        &self,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, KeysetError> {
        Ok(self.open(ciphertext, associated_data)?)
    }
}
