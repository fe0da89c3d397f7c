//! Keyset documents exchanged between the key-management tool, keyset files,
//! and database-backed stores.
//!
//! All types serialise as camelCase JSON. Key material travels as standard
//! base64 inside [`KeyData::value`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::KeysetError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Lifecycle status of a key inside a keyset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    /// The key is used for decryption and may be promoted to primary.
    Enabled,
    /// The key is kept but never used.
    Disabled,
    /// The key material has been wiped.
    Destroyed,
}

impl KeyStatus {
    /// Upper-case name used in listings.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Enabled => "ENABLED",
            KeyStatus::Disabled => "DISABLED",
            KeyStatus::Destroyed => "DESTROYED",
        }
    }
}

/// How ciphertexts produced by a key are prefixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputPrefixType {
    /// 5-byte prefix: `0x01 || big-endian key id`.
    Tink,
    /// No prefix.
    Raw,
}

impl OutputPrefixType {
    /// Upper-case name used in listings.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputPrefixType::Tink => "TINK",
            OutputPrefixType::Raw => "RAW",
        }
    }
}

// ---------------------------------------------------------------------------
// Keyset documents
// ---------------------------------------------------------------------------

/// Serialised key material together with its type.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyData {
    /// Identifies the primitive implementation, e.g. `sealfield.AesGcmSivKey`.
    pub type_url: String,
    /// Raw key bytes.
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    /// Always `SYMMETRIC` for the key types this crate knows about.
    #[serde(default = "default_key_material_type")]
    pub key_material_type: String,
}

fn default_key_material_type() -> String {
    "SYMMETRIC".into()
}

impl KeyData {
    /// Build symmetric key data of the given type.
    pub fn symmetric(type_url: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
            key_material_type: default_key_material_type(),
        }
    }
}

impl std::fmt::Debug for KeyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyData")
            .field("type_url", &self.type_url)
            .field("value", &"[REDACTED]")
            .field("key_material_type", &self.key_material_type)
            .finish()
    }
}

/// A single key inside a [`Keyset`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    pub key_id: u32,
    pub status: KeyStatus,
    pub output_prefix_type: OutputPrefixType,
    pub key_data: KeyData,
}

impl Key {
    /// Metadata view of this key, without key material.
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            type_url: self.key_data.type_url.clone(),
            status: self.status,
            key_id: self.key_id,
            output_prefix_type: self.output_prefix_type,
        }
    }
}

/// A collection of keys with one designated primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keyset {
    pub primary_key_id: u32,
    #[serde(default)]
    pub key: Vec<Key>,
}

impl Keyset {
    /// Parse a keyset from its JSON representation and check its consistency.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::Malformed`] on invalid JSON or an inconsistent keyset.
    pub fn from_json(json: &str) -> Result<Self, KeysetError> {
        let keyset: Keyset = serde_json::from_str(json)?;
        keyset.validate()?;
        Ok(keyset)
    }

    /// Pretty JSON representation, including key material.
    pub fn to_json(&self) -> Result<String, KeysetError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check that key ids are unique and that the primary key exists and is enabled.
    pub fn validate(&self) -> Result<(), KeysetError> {
        if self.key.is_empty() {
            return Err(KeysetError::Malformed("keyset contains no keys".into()));
        }
        let mut seen = HashSet::new();
        for key in &self.key {
            if !seen.insert(key.key_id) {
                return Err(KeysetError::Malformed(format!(
                    "duplicate key id {}",
                    key.key_id
                )));
            }
        }
        match self.key.iter().find(|k| k.key_id == self.primary_key_id) {
            Some(k) if k.status == KeyStatus::Enabled => Ok(()),
            Some(_) => Err(KeysetError::Malformed(format!(
                "primary key {} is not enabled",
                self.primary_key_id
            ))),
            None => Err(KeysetError::Malformed(format!(
                "primary key {} not found in keyset",
                self.primary_key_id
            ))),
        }
    }

    /// Metadata view of the keyset.
    pub fn info(&self) -> KeysetInfo {
        KeysetInfo {
            primary_key_id: self.primary_key_id,
            key_info: self.key.iter().map(Key::info).collect(),
        }
    }
}

/// Metadata-only view of a [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub type_url: String,
    pub status: KeyStatus,
    pub key_id: u32,
    pub output_prefix_type: OutputPrefixType,
}

/// Metadata-only view of a [`Keyset`]; safe to print and log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysetInfo {
    pub primary_key_id: u32,
    #[serde(default)]
    pub key_info: Vec<KeyInfo>,
}

/// A keyset encrypted under a master key.
///
/// `encrypted_keyset` is the master-key ciphertext of the cleartext keyset JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyset {
    #[serde(with = "base64_bytes")]
    pub encrypted_keyset: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyset_info: Option<KeysetInfo>,
}

/// Serde adapter storing byte vectors as standard base64 strings.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
