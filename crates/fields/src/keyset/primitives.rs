//! Keyset-level primitives: prefix handling and key selection on top of the
//! per-key ciphers.

use std::sync::Arc;

use common::{KeysetError, PrimitiveFamily};
use tracing::debug;

use super::{Entry, KeySource, PREFIX_LEN};
use crate::crypto::{Aead, DeterministicAead};

fn check_family(source: &dyn KeySource, expected: PrimitiveFamily) -> Result<(), KeysetError> {
    let primary = source.primary()?;
    if primary.primitive.family() != expected {
        return Err(KeysetError::UnsupportedPrimitive {
            expected: expected.describe(),
            type_url: primary.type_url,
        });
    }
    Ok(())
}

fn with_prefix(prefix: &[u8], body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + body.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(&body);
    out
}

/// Try prefixed keys first, then raw keys; the first successful open wins.
fn open_with<F>(source: &dyn KeySource, ciphertext: &[u8], open: F) -> Result<Vec<u8>, KeysetError>
where
    F: Fn(&Entry, &[u8]) -> Result<Vec<u8>, KeysetError>,
{
    if ciphertext.len() > PREFIX_LEN {
        let (prefix, body) = ciphertext.split_at(PREFIX_LEN);
        for entry in source.entries_for_prefix(prefix)? {
            match open(&entry, body) {
                Ok(plaintext) => return Ok(plaintext),
                Err(e) => debug!(key_id = entry.key_id, error = %e, "prefixed key did not match"),
            }
        }
    }

    for entry in source.entries_for_prefix(&[])? {
        if let Ok(plaintext) = open(&entry, ciphertext) {
            return Ok(plaintext);
        }
    }

    Err(KeysetError::Crypto("decryption failed".into()))
}

/// Randomised AEAD over every enabled key of a keyset.
#[derive(Clone)]
pub struct KeysetAead {
    source: Arc<dyn KeySource>,
}

impl KeysetAead {
    /// Wrap `source`.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::UnsupportedPrimitive`] if the keyset holds
    /// deterministic keys.
    pub fn new(source: Arc<dyn KeySource>) -> Result<Self, KeysetError> {
        check_family(source.as_ref(), PrimitiveFamily::Aead)?;
        Ok(Self { source })
    }
}

impl Aead for KeysetAead {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, KeysetError> {
        let primary = self.source.primary()?;
        let body = primary.aead()?.seal(plaintext, associated_data)?;
        Ok(with_prefix(&primary.prefix, body))
    }

    fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, KeysetError> {
        open_with(self.source.as_ref(), ciphertext, |entry, body| {
            Ok(entry.aead()?.open(body, associated_data)?)
        })
    }
}

/// Deterministic AEAD over every enabled key of a keyset.
#[derive(Clone)]
pub struct KeysetDeterministicAead {
    source: Arc<dyn KeySource>,
}

impl KeysetDeterministicAead {
    /// Wrap `source`.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::UnsupportedPrimitive`] if the keyset holds
    /// randomised AEAD keys.
    pub fn new(source: Arc<dyn KeySource>) -> Result<Self, KeysetError> {
        check_family(source.as_ref(), PrimitiveFamily::DeterministicAead)?;
        Ok(Self { source })
    }

    /// Encrypt `plaintext` under every enabled key, each with its own prefix.
    ///
    /// Equality lookups match against all of these so that rows written before
    /// a primary-key rotation are still found.
    pub fn encrypt_with_all_keys(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<Vec<u8>>, KeysetError> {
        self.source
            .all()?
            .iter()
            .map(|entry| {
                let body = entry.daead()?.seal(plaintext, associated_data)?;
                Ok(with_prefix(&entry.prefix, body))
            })
            .collect()
    }
}

impl DeterministicAead for KeysetDeterministicAead {
    fn encrypt_deterministically(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, KeysetError> {
        let primary = self.source.primary()?;
        let body = primary.daead()?.seal(plaintext, associated_data)?;
        Ok(with_prefix(&primary.prefix, body))
    }

    fn decrypt_deterministically(
        &self,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, KeysetError> {
        open_with(self.source.as_ref(), ciphertext, |entry, body| {
            Ok(entry.daead()?.open(body, associated_data)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyset::{new_key_data, output_prefix, PrimitiveSet};
    use common::{Key, KeyStatus, KeyTemplate};

    fn key(id: u32, template: &str) -> Key {
        let template = KeyTemplate::from_name(template).unwrap();
        Key {
            key_id: id,
            status: KeyStatus::Enabled,
            output_prefix_type: template.output_prefix_type,
            key_data: new_key_data(&template),
        }
    }

    fn source(primary: u32, keys: &[Key]) -> Arc<dyn KeySource> {
        Arc::new(PrimitiveSet::from_keys(primary, keys).unwrap())
    }

    #[test]
    fn ciphertext_carries_primary_prefix() {
        let aead = KeysetAead::new(source(7, &[key(7, "AES256_GCM_SIV")])).unwrap();
        let ct = aead.encrypt(b"hello", b"").unwrap();
        assert_eq!(&ct[..PREFIX_LEN], output_prefix(7, common::OutputPrefixType::Tink).as_slice());
        assert_eq!(aead.decrypt(&ct, b"").unwrap(), b"hello");
    }

    #[test]
    fn old_primary_still_decrypts_after_rotation() {
        let k1 = key(1, "AES256_GCM_SIV");
        let k2 = key(2, "AES256_GCM_SIV");
        let before = KeysetAead::new(source(1, &[k1.clone()])).unwrap();
        let ct = before.encrypt(b"legacy", b"aad").unwrap();

        let after = KeysetAead::new(source(2, &[k1, k2])).unwrap();
        assert_eq!(after.decrypt(&ct, b"aad").unwrap(), b"legacy");
        let fresh = after.encrypt(b"new", b"aad").unwrap();
        assert_eq!(fresh[1..PREFIX_LEN], 2u32.to_be_bytes());
    }

    #[test]
    fn raw_keys_decrypt_unprefixed_ciphertext() {
        let aead = KeysetAead::new(source(3, &[key(3, "AES256_GCM_SIV_RAW")])).unwrap();
        let ct = aead.encrypt(b"raw", b"").unwrap();
        assert_eq!(aead.decrypt(&ct, b"").unwrap(), b"raw");
    }

    #[test]
    fn unknown_key_fails() {
        let a = KeysetAead::new(source(1, &[key(1, "AES256_GCM_SIV")])).unwrap();
        let b = KeysetAead::new(source(2, &[key(2, "AES256_GCM_SIV")])).unwrap();
        let ct = a.encrypt(b"x", b"").unwrap();
        assert!(matches!(b.decrypt(&ct, b""), Err(KeysetError::Crypto(_))));
    }

    #[test]
    fn family_mismatch_rejected() {
        let src = source(1, &[key(1, "AES256_GCM_SIV")]);
        assert!(matches!(
            KeysetDeterministicAead::new(src),
            Err(KeysetError::UnsupportedPrimitive { .. })
        ));
        let src = source(1, &[key(1, "AES256_SIV")]);
        assert!(KeysetAead::new(src).is_err());
    }

    #[test]
    fn deterministic_all_keys_covers_rotation() {
        let k1 = key(1, "AES256_SIV");
        let k2 = key(2, "AES256_SIV");
        let old = KeysetDeterministicAead::new(source(1, &[k1.clone()])).unwrap();
        let stored = old.encrypt_deterministically(b"42", b"").unwrap();

        let rotated = KeysetDeterministicAead::new(source(2, &[k1, k2])).unwrap();
        assert_ne!(rotated.encrypt_deterministically(b"42", b"").unwrap(), stored);
        let candidates = rotated.encrypt_with_all_keys(b"42", b"").unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.contains(&stored));
        assert_eq!(rotated.decrypt_deterministically(&stored, b"").unwrap(), b"42");
    }
}
