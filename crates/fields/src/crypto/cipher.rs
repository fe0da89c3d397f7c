//! AES-GCM-SIV encryption and decryption of individual field values.
//!
//! Two constructions are provided:
//!
//! - [`AesGcmSivAead`]: randomised AEAD. A fresh 96-bit nonce is drawn from the
//!   OS CSPRNG for every message.
//! - [`SivDeterministicAead`]: deterministic AEAD. The nonce is synthesised as
//!   `HMAC-SHA256(mac_key, be64(len(aad)) || aad || plaintext)` truncated to
//!   96 bits, so identical plaintext + AAD + key always yields identical
//!   ciphertext. AES-GCM-SIV stays secure under the resulting nonce reuse.
//!
//! Both emit `nonce || ciphertext || tag`.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead as _, KeyInit, OsRng, Payload},
    Aes128GcmSiv, Aes256GcmSiv, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use common::KeysetError;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag appended by AES-GCM-SIV.
pub const TAG_LEN: usize = 16;

/// Byte length of a deterministic AEAD key: 32-byte MAC key + 32-byte AES key.
pub const SIV_KEY_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is not one of the supported lengths.
    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// AES-GCM-SIV encryption or decryption failed.
    #[error("aead operation failed")]
    AeadFailure,

    /// The ciphertext is too short to hold a nonce and tag.
    #[error("ciphertext too short")]
    Truncated,

    /// The synthetic nonce does not match the decrypted plaintext.
    #[error("synthetic nonce mismatch")]
    NonceMismatch,
}

impl From<CipherError> for KeysetError {
    fn from(e: CipherError) -> Self {
        KeysetError::Crypto(e.to_string())
    }
}

enum GcmSiv {
    Aes128(Aes128GcmSiv),
    Aes256(Aes256GcmSiv),
}

impl GcmSiv {
    fn new(key: &[u8]) -> Result<Self, CipherError> {
        match key.len() {
            16 => Aes128GcmSiv::new_from_slice(key)
                .map(GcmSiv::Aes128)
                .map_err(|_| CipherError::InvalidKeyLength(key.len())),
            32 => Aes256GcmSiv::new_from_slice(key)
                .map(GcmSiv::Aes256)
                .map_err(|_| CipherError::InvalidKeyLength(key.len())),
            n => Err(CipherError::InvalidKeyLength(n)),
        }
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload { msg, aad };
        let sealed = match self {
            GcmSiv::Aes128(c) => c.encrypt(nonce, payload),
            GcmSiv::Aes256(c) => c.encrypt(nonce, payload),
        };
        sealed.map_err(|_| CipherError::AeadFailure)
    }

    fn open(&self, nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload { msg, aad };
        let opened = match self {
            GcmSiv::Aes128(c) => c.decrypt(nonce, payload),
            GcmSiv::Aes256(c) => c.decrypt(nonce, payload),
        };
        opened.map_err(|_| CipherError::AeadFailure)
    }
}

fn split_nonce(ciphertext: &[u8]) -> Result<(&[u8], &[u8]), CipherError> {
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(CipherError::Truncated);
    }
    Ok(ciphertext.split_at(NONCE_LEN))
}

/// Randomised AES-GCM-SIV with a 128- or 256-bit key.
pub struct AesGcmSivAead {
    cipher: GcmSiv,
}

impl AesGcmSivAead {
    /// Build the primitive from raw key bytes (16 or 32 bytes).
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] for any other length.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        Ok(Self {
            cipher: GcmSiv::new(key)?,
        })
    }

    /// Encrypt `plaintext`, binding `aad` into the tag.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self.cipher.seal(&nonce, plaintext, aad)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::AeadFailure`] if authentication fails (wrong key,
    /// wrong AAD, or tampered data).
    pub fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let (nonce, body) = split_nonce(ciphertext)?;
        self.cipher.open(nonce, body, aad)
    }
}

/// Deterministic AEAD over AES-256-GCM-SIV with an HMAC-SHA256 synthetic nonce.
pub struct SivDeterministicAead {
    mac_key: [u8; 32],
    cipher: GcmSiv,
}

impl SivDeterministicAead {
    /// Build the primitive from a [`SIV_KEY_LEN`]-byte key.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != SIV_KEY_LEN {
            return Err(CipherError::InvalidKeyLength(key.len()));
        }
        let (mac, enc) = key.split_at(32);
        let mut mac_key = [0u8; 32];
        mac_key.copy_from_slice(mac);
        Ok(Self {
            mac_key,
            cipher: GcmSiv::new(enc)?,
        })
    }

    fn synthetic_mac(&self, plaintext: &[u8], aad: &[u8]) -> Result<HmacSha256, CipherError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|_| CipherError::InvalidKeyLength(self.mac_key.len()))?;
        mac.update(&(aad.len() as u64).to_be_bytes());
        mac.update(aad);
        mac.update(plaintext);
        Ok(mac)
    }

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let digest = self.synthetic_mac(plaintext, aad)?.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        let sealed = self.cipher.seal(&nonce, plaintext, aad)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn open(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let (nonce, body) = split_nonce(ciphertext)?;
        let plaintext = self.cipher.open(nonce, body, aad)?;
        self.synthetic_mac(&plaintext, aad)?
            .verify_truncated_left(nonce)
            .map_err(|_| CipherError::NonceMismatch)?;
        Ok(plaintext)
    }
}

impl Drop for SivDeterministicAead {
    fn drop(&mut self) {
        self.mac_key.iter_mut().for_each(|b| *b = 0);
    }
}
