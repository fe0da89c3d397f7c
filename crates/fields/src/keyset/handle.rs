//! [`KeysetHandle`]: a parsed keyset, read from or written to JSON.

use std::sync::Arc;

use common::{EncryptedKeyset, Key, KeyStatus, KeyTemplate, Keyset, KeysetError, KeysetInfo};

use super::{new_key_data, random_key_id, KeySource, KeysetAead, KeysetDeterministicAead, PrimitiveSet};
use crate::crypto::Aead;

/// A validated keyset. Primitives are built from it on demand with
/// [`Self::primitive_set`], [`Self::aead`] and [`Self::deterministic_aead`].
#[derive(Debug, Clone)]
pub struct KeysetHandle {
    keyset: Keyset,
}

impl KeysetHandle {
    /// Wrap an already-parsed keyset after validating it.
    pub fn from_keyset(keyset: Keyset) -> Result<Self, KeysetError> {
        keyset.validate()?;
        Ok(Self { keyset })
    }

    /// Read a keyset stored as cleartext JSON.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::Malformed`] if the document is not a valid keyset.
    pub fn read_cleartext(json: &str) -> Result<Self, KeysetError> {
        Ok(Self {
            keyset: Keyset::from_json(json)?,
        })
    }

    /// Read a keyset encrypted under `master`.
    ///
    /// The master key decrypts `encryptedKeyset` with empty associated data.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::Crypto`] if the master key cannot decrypt the
    /// keyset and [`KeysetError::Malformed`] if the result is not a keyset.
    pub fn read_encrypted(json: &str, master: &dyn Aead) -> Result<Self, KeysetError> {
        let wrapped: EncryptedKeyset = serde_json::from_str(json)?;
        let cleartext = master.decrypt(&wrapped.encrypted_keyset, &[])?;
        let text = std::str::from_utf8(&cleartext)
            .map_err(|_| KeysetError::Malformed("decrypted keyset is not UTF-8".into()))?;
        Self::read_cleartext(text)
    }

    /// Create a keyset holding one fresh primary key.
    pub fn generate(template: &KeyTemplate) -> Self {
        let key_id = random_key_id();
        Self {
            keyset: Keyset {
                primary_key_id: key_id,
                key: vec![Key {
                    key_id,
                    status: KeyStatus::Enabled,
                    output_prefix_type: template.output_prefix_type,
                    key_data: new_key_data(template),
                }],
            },
        }
    }

    /// Add a non-primary key and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::ImproperlyConfigured`] if the template belongs to
    /// a different primitive family than the existing keys.
    pub fn add_key(&mut self, template: &KeyTemplate) -> Result<u32, KeysetError> {
        let current = self.primitive_set()?.family()?;
        if current != template.family() {
            return Err(KeysetError::ImproperlyConfigured(format!(
                "template `{}` is {} but keyset holds {} keys",
                template.name,
                template.family().describe(),
                current.describe()
            )));
        }

        let key_id = loop {
            let candidate = random_key_id();
            if self.keyset.key.iter().all(|k| k.key_id != candidate) {
                break candidate;
            }
        };
        self.keyset.key.push(Key {
            key_id,
            status: KeyStatus::Enabled,
            output_prefix_type: template.output_prefix_type,
            key_data: new_key_data(template),
        });
        Ok(key_id)
    }

    /// Promote an enabled key to primary.
    pub fn set_primary(&mut self, key_id: u32) -> Result<(), KeysetError> {
        match self.keyset.key.iter().find(|k| k.key_id == key_id) {
            Some(k) if k.status == KeyStatus::Enabled => {
                self.keyset.primary_key_id = key_id;
                Ok(())
            }
            Some(_) => Err(KeysetError::ImproperlyConfigured(format!(
                "key {key_id} is not enabled"
            ))),
            None => Err(KeysetError::NotFound(format!("key {key_id} not in keyset"))),
        }
    }

    /// Cleartext JSON, including key material.
    pub fn write_cleartext(&self) -> Result<String, KeysetError> {
        self.keyset.to_json()
    }

    /// JSON with the keyset encrypted under `master`.
    pub fn write_encrypted(&self, master: &dyn Aead) -> Result<String, KeysetError> {
        let cleartext = serde_json::to_vec(&self.keyset)?;
        let wrapped = EncryptedKeyset {
            encrypted_keyset: master.encrypt(&cleartext, &[])?,
            keyset_info: Some(self.info()),
        };
        Ok(serde_json::to_string_pretty(&wrapped)?)
    }

    pub fn keyset(&self) -> &Keyset {
        &self.keyset
    }

    pub fn info(&self) -> KeysetInfo {
        self.keyset.info()
    }

    /// Instantiate every enabled key.
    pub fn primitive_set(&self) -> Result<PrimitiveSet, KeysetError> {
        PrimitiveSet::from_keys(self.keyset.primary_key_id, &self.keyset.key)
    }

    /// Randomised AEAD over this keyset.
    pub fn aead(&self) -> Result<KeysetAead, KeysetError> {
        KeysetAead::new(Arc::new(self.primitive_set()?))
    }

    /// Deterministic AEAD over this keyset.
    pub fn deterministic_aead(&self) -> Result<KeysetDeterministicAead, KeysetError> {
        KeysetDeterministicAead::new(Arc::new(self.primitive_set()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DeterministicAead, MockAead};

    fn template(name: &str) -> KeyTemplate {
        KeyTemplate::from_name(name).unwrap()
    }

    #[test]
    fn cleartext_round_trip() {
        let handle = KeysetHandle::generate(&template("AES256_GCM_SIV"));
        let json = handle.write_cleartext().unwrap();
        let read = KeysetHandle::read_cleartext(&json).unwrap();
        assert_eq!(read.keyset(), handle.keyset());
    }

    #[test]
    fn encrypted_keyset_needs_matching_master() {
        let master = KeysetHandle::generate(&template("AES256_GCM_SIV")).aead().unwrap();
        let handle = KeysetHandle::generate(&template("AES256_SIV"));
        let json = handle.write_encrypted(&master).unwrap();
        assert!(!json.contains("keyData"));

        let read = KeysetHandle::read_encrypted(&json, &master).unwrap();
        let ct = read
            .deterministic_aead()
            .unwrap()
            .encrypt_deterministically(b"x", b"")
            .unwrap();
        assert_eq!(
            handle
                .deterministic_aead()
                .unwrap()
                .decrypt_deterministically(&ct, b"")
                .unwrap(),
            b"x"
        );

        let other = KeysetHandle::generate(&template("AES256_GCM_SIV")).aead().unwrap();
        assert!(matches!(
            KeysetHandle::read_encrypted(&json, &other),
            Err(KeysetError::Crypto(_))
        ));
    }

    #[test]
    fn master_key_failure_propagates() {
        let handle = KeysetHandle::generate(&template("AES256_GCM_SIV"));
        let mut master = MockAead::new();
        master
            .expect_encrypt()
            .returning(|pt, _| Ok(pt.to_vec()));
        master
            .expect_decrypt()
            .returning(|_, _| Err(KeysetError::Crypto("kms unavailable".into())));

        let json = handle.write_encrypted(&master).unwrap();
        let err = KeysetHandle::read_encrypted(&json, &master).unwrap_err();
        assert!(err.to_string().contains("kms unavailable"));
    }

    #[test]
    fn master_key_receives_empty_associated_data() {
        let handle = KeysetHandle::generate(&template("AES256_GCM_SIV"));
        let mut master = MockAead::new();
        master
            .expect_encrypt()
            .withf(|_, aad| aad.is_empty())
            .times(1)
            .returning(|pt, _| Ok(pt.to_vec()));
        handle.write_encrypted(&master).unwrap();
    }

    #[test]
    fn add_key_and_promote() {
        let mut handle = KeysetHandle::generate(&template("AES256_GCM_SIV"));
        let first = handle.keyset().primary_key_id;
        let second = handle.add_key(&template("AES128_GCM_SIV")).unwrap();
        assert_ne!(first, second);
        assert_eq!(handle.keyset().primary_key_id, first);
        handle.set_primary(second).unwrap();
        assert_eq!(handle.info().primary_key_id, second);
        assert_eq!(handle.primitive_set().unwrap().len(), 2);
    }

    #[test]
    fn add_key_rejects_other_family() {
        let mut handle = KeysetHandle::generate(&template("AES256_GCM_SIV"));
        assert!(handle.add_key(&template("AES256_SIV")).is_err());
    }

    #[test]
    fn set_primary_unknown_key() {
        let mut handle = KeysetHandle::generate(&template("AES256_GCM_SIV"));
        assert!(matches!(handle.set_primary(0), Err(KeysetError::NotFound(_))));
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(
            KeysetHandle::read_cleartext("{\"test\": \"data\"}"),
            Err(KeysetError::Malformed(_))
        ));
    }
}
