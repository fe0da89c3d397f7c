//! Keysets: named groups of keys with one primary, wrapped as primitives.
//!
//! A keyset is turned into a [`PrimitiveSet`] (or any other [`KeySource`]) and
//! then wrapped by [`KeysetAead`] / [`KeysetDeterministicAead`], which:
//!
//! - encrypt with the primary key and prepend that key's output prefix;
//! - decrypt by trying every enabled key whose prefix matches, then every raw key.
//!
//! # Output prefix
//!
//! ```text
//! TINK: 0x01 || be32(key_id)      (5 bytes)
//! RAW:  (empty)
//! ```

pub mod handle;
pub mod primitives;

pub use handle::KeysetHandle;
pub use primitives::{KeysetAead, KeysetDeterministicAead};

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use common::{Key, KeyData, KeyStatus, KeyTemplate, KeysetError, OutputPrefixType, PrimitiveFamily};

use crate::crypto::{AesGcmSivAead, SivDeterministicAead};

/// First byte of a `TINK` output prefix.
pub const TINK_START_BYTE: u8 = 0x01;

/// Length of a `TINK` output prefix.
pub const PREFIX_LEN: usize = 5;

/// Compute the ciphertext prefix for a key.
pub fn output_prefix(key_id: u32, prefix_type: OutputPrefixType) -> Vec<u8> {
    match prefix_type {
        OutputPrefixType::Tink => {
            let mut prefix = Vec::with_capacity(PREFIX_LEN);
            prefix.push(TINK_START_BYTE);
            prefix.extend_from_slice(&key_id.to_be_bytes());
            prefix
        }
        OutputPrefixType::Raw => Vec::new(),
    }
}

/// Generate fresh key material for `template`.
pub fn new_key_data(template: &KeyTemplate) -> KeyData {
    let mut value = vec![0u8; template.key_size];
    OsRng.fill_bytes(&mut value);
    KeyData::symmetric(template.type_url, value)
}

/// Draw a random non-zero key id.
pub(crate) fn random_key_id() -> u32 {
    loop {
        let id = OsRng.next_u32();
        if id != 0 {
            return id;
        }
    }
}

/// A concrete primitive built from one key.
#[derive(Clone)]
pub enum KeyPrimitive {
    Aead(Arc<AesGcmSivAead>),
    Deterministic(Arc<SivDeterministicAead>),
}

impl KeyPrimitive {
    /// Instantiate the primitive described by `key_data`.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::Malformed`] for unknown type URLs or bad key lengths.
    pub fn from_key_data(key_data: &KeyData) -> Result<Self, KeysetError> {
        match PrimitiveFamily::of_type_url(&key_data.type_url) {
            Some(PrimitiveFamily::Aead) => Ok(KeyPrimitive::Aead(Arc::new(
                AesGcmSivAead::new(&key_data.value)
                    .map_err(|e| KeysetError::Malformed(e.to_string()))?,
            ))),
            Some(PrimitiveFamily::DeterministicAead) => Ok(KeyPrimitive::Deterministic(Arc::new(
                SivDeterministicAead::new(&key_data.value)
                    .map_err(|e| KeysetError::Malformed(e.to_string()))?,
            ))),
            None => Err(KeysetError::Malformed(format!(
                "unknown key type `{}`",
                key_data.type_url
            ))),
        }
    }

    pub fn family(&self) -> PrimitiveFamily {
        match self {
            KeyPrimitive::Aead(_) => PrimitiveFamily::Aead,
            KeyPrimitive::Deterministic(_) => PrimitiveFamily::DeterministicAead,
        }
    }
}

/// One usable key: its id, prefix, and instantiated primitive.
#[derive(Clone)]
pub struct Entry {
    pub key_id: u32,
    pub status: KeyStatus,
    pub output_prefix_type: OutputPrefixType,
    pub prefix: Vec<u8>,
    pub type_url: String,
    pub primitive: KeyPrimitive,
}

impl Entry {
    /// Build an entry from a keyset key.
    pub fn from_key(key: &Key) -> Result<Self, KeysetError> {
        Ok(Self {
            key_id: key.key_id,
            status: key.status,
            output_prefix_type: key.output_prefix_type,
            prefix: output_prefix(key.key_id, key.output_prefix_type),
            type_url: key.key_data.type_url.clone(),
            primitive: KeyPrimitive::from_key_data(&key.key_data)?,
        })
    }

    pub(crate) fn aead(&self) -> Result<&AesGcmSivAead, KeysetError> {
        match &self.primitive {
            KeyPrimitive::Aead(p) => Ok(p.as_ref()),
            KeyPrimitive::Deterministic(_) => Err(self.unsupported(PrimitiveFamily::Aead)),
        }
    }

    pub(crate) fn daead(&self) -> Result<&SivDeterministicAead, KeysetError> {
        match &self.primitive {
            KeyPrimitive::Deterministic(p) => Ok(p.as_ref()),
            KeyPrimitive::Aead(_) => Err(self.unsupported(PrimitiveFamily::DeterministicAead)),
        }
    }

    fn unsupported(&self, expected: PrimitiveFamily) -> KeysetError {
        KeysetError::UnsupportedPrimitive {
            expected: expected.describe(),
            type_url: self.type_url.clone(),
        }
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key_id", &self.key_id)
            .field("status", &self.status)
            .field("output_prefix_type", &self.output_prefix_type)
            .field("type_url", &self.type_url)
            .finish_non_exhaustive()
    }
}

/// Anything that can hand out key entries to the keyset primitives.
///
/// Implemented by the static [`PrimitiveSet`] and by database-backed keysets,
/// which load keys lazily and observe primary-key promotions.
pub trait KeySource: Send + Sync {
    /// The entry new ciphertexts are produced with.
    fn primary(&self) -> Result<Entry, KeysetError>;

    /// Enabled entries whose output prefix equals `prefix`. An empty prefix
    /// selects the raw keys.
    fn entries_for_prefix(&self, prefix: &[u8]) -> Result<Vec<Entry>, KeysetError>;

    /// Every enabled entry.
    fn all(&self) -> Result<Vec<Entry>, KeysetError>;

    /// The family all keys of this source belong to.
    fn family(&self) -> Result<PrimitiveFamily, KeysetError> {
        Ok(self.primary()?.primitive.family())
    }
}

/// Enabled keys of a keyset, grouped by output prefix.
#[derive(Debug, Clone)]
pub struct PrimitiveSet {
    primary: Entry,
    by_prefix: HashMap<Vec<u8>, Vec<Entry>>,
}

impl PrimitiveSet {
    /// Build the set from a validated keyset.
    ///
    /// Disabled and destroyed keys are skipped. Keys of the other primitive
    /// family are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::Malformed`] if the primary is missing or the
    /// keyset mixes primitive families.
    pub fn from_keys(primary_key_id: u32, keys: &[Key]) -> Result<Self, KeysetError> {
        let mut by_prefix: HashMap<Vec<u8>, Vec<Entry>> = HashMap::new();
        let mut primary = None;
        let mut family = None;

        for key in keys.iter().filter(|k| k.status == KeyStatus::Enabled) {
            let entry = Entry::from_key(key)?;
            let entry_family = entry.primitive.family();
            if *family.get_or_insert(entry_family) != entry_family {
                return Err(KeysetError::Malformed(
                    "keyset mixes AEAD and deterministic AEAD keys".into(),
                ));
            }
            if key.key_id == primary_key_id {
                primary = Some(entry.clone());
            }
            by_prefix.entry(entry.prefix.clone()).or_default().push(entry);
        }

        let primary = primary.ok_or_else(|| {
            KeysetError::Malformed(format!("primary key {primary_key_id} is not an enabled key"))
        })?;
        Ok(Self { primary, by_prefix })
    }

    pub fn len(&self) -> usize {
        self.by_prefix.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_prefix.is_empty()
    }
}

impl KeySource for PrimitiveSet {
    fn primary(&self) -> Result<Entry, KeysetError> {
        Ok(self.primary.clone())
    }

    fn entries_for_prefix(&self, prefix: &[u8]) -> Result<Vec<Entry>, KeysetError> {
        Ok(self.by_prefix.get(prefix).cloned().unwrap_or_default())
    }

    fn all(&self) -> Result<Vec<Entry>, KeysetError> {
        Ok(self.by_prefix.values().flatten().cloned().collect())
    }
}
