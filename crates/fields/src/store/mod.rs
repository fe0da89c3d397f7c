//! Database-backed keysets: keyset and key records kept in a [`KeysetStore`].
//!
//! # Layout
//!
//! - [`KeysetRecord`]: a named keyset and the id of its primary key.
//! - [`KeyRecord`]: one key. `key_data` is the serialised [`common::KeyData`]
//!   encrypted under the store's protection keyset with associated data
//!   `"<keyset>:<key id>"`, so key material is never stored in the clear.
//!
//! # Invariants
//!
//! - Key ids are unique across the whole store and never reused.
//! - Deleting a keyset deletes its keys.
//! - All keys of one keyset belong to the same primitive family.

pub mod database;
pub mod file;
pub mod memory;

pub use database::DatabaseKeyset;
pub use file::JsonFileKeysetStore;
pub use memory::MemoryKeysetStore;

use std::collections::BTreeMap;

use common::protocol::base64_bytes;
use common::{KeyStatus, KeysetError, OutputPrefixType};
use serde::{Deserialize, Serialize};

/// A named keyset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetRecord {
    pub name: String,
    pub primary_key_id: Option<u32>,
}

/// A key belonging to a keyset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: u32,
    pub keyset: String,
    pub type_url: String,
    /// Protected, serialised key data.
    #[serde(with = "base64_bytes")]
    pub key_data: Vec<u8>,
    pub status: KeyStatus,
    pub output_prefix_type: OutputPrefixType,
    /// Stored so keys can be found by ciphertext prefix without parsing it.
    #[serde(with = "base64_bytes")]
    pub output_prefix: Vec<u8>,
}

/// Persistence for keyset and key records.
pub trait KeysetStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`KeysetError::NotFound`] if no keyset is called `name`.
    fn get_keyset(&self, name: &str) -> Result<KeysetRecord, KeysetError>;

    fn list_keysets(&self) -> Result<Vec<KeysetRecord>, KeysetError>;

    /// Create an empty keyset. Names are unique.
    fn insert_keyset(&self, name: &str) -> Result<KeysetRecord, KeysetError>;

    fn set_primary(&self, name: &str, key_id: u32) -> Result<(), KeysetError>;

    /// Delete a keyset and every key it owns.
    fn delete_keyset(&self, name: &str) -> Result<(), KeysetError>;

    /// Reserve the next key id.
    fn next_key_id(&self) -> Result<u32, KeysetError>;

    fn insert_key(&self, key: KeyRecord) -> Result<(), KeysetError>;

    /// Keys of `keyset`, ordered by id.
    fn keys(&self, keyset: &str) -> Result<Vec<KeyRecord>, KeysetError>;

    fn keys_with_prefix(&self, keyset: &str, prefix: &[u8]) -> Result<Vec<KeyRecord>, KeysetError> {
        Ok(self
            .keys(keyset)?
            .into_iter()
            .filter(|k| k.output_prefix == prefix)
            .collect())
    }
}

/// In-memory representation shared by the memory and JSON file stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    keysets: BTreeMap<String, KeysetRecord>,
    #[serde(default)]
    keys: BTreeMap<u32, KeyRecord>,
    #[serde(default)]
    last_key_id: u32,
}

impl StoreState {
    fn get_keyset(&self, name: &str) -> Result<KeysetRecord, KeysetError> {
        self.keysets
            .get(name)
            .cloned()
            .ok_or_else(|| KeysetError::NotFound(format!("Keyset \"{name}\" not found")))
    }

    fn list_keysets(&self) -> Vec<KeysetRecord> {
        self.keysets.values().cloned().collect()
    }

    fn insert_keyset(&mut self, name: &str) -> Result<KeysetRecord, KeysetError> {
        if name.trim().is_empty() {
            return Err(KeysetError::ImproperlyConfigured("keyset name must not be empty".into()));
        }
        if self.keysets.contains_key(name) {
            return Err(KeysetError::ImproperlyConfigured(format!(
                "Keyset \"{name}\" already exists"
            )));
        }
        let record = KeysetRecord {
            name: name.to_owned(),
            primary_key_id: None,
        };
        self.keysets.insert(name.to_owned(), record.clone());
        Ok(record)
    }

    fn set_primary(&mut self, name: &str, key_id: u32) -> Result<(), KeysetError> {
        match self.keys.get(&key_id) {
            Some(k) if k.keyset == name => {}
            _ => {
                return Err(KeysetError::NotFound(format!(
                    "Key ID {key_id} not found in keyset"
                )))
            }
        }
        let record = self
            .keysets
            .get_mut(name)
            .ok_or_else(|| KeysetError::NotFound(format!("Keyset \"{name}\" not found")))?;
        record.primary_key_id = Some(key_id);
        Ok(())
    }

    fn delete_keyset(&mut self, name: &str) -> Result<(), KeysetError> {
        if self.keysets.remove(name).is_none() {
            return Err(KeysetError::NotFound(format!("Keyset \"{name}\" not found")));
        }
        self.keys.retain(|_, k| k.keyset != name);
        Ok(())
    }

    fn next_key_id(&mut self) -> u32 {
        self.last_key_id += 1;
        self.last_key_id
    }

    fn insert_key(&mut self, key: KeyRecord) -> Result<(), KeysetError> {
        if !self.keysets.contains_key(&key.keyset) {
            return Err(KeysetError::NotFound(format!(
                "Keyset \"{}\" not found",
                key.keyset
            )));
        }
        if self.keys.contains_key(&key.id) {
            return Err(KeysetError::ImproperlyConfigured(format!(
                "key id {} already in use",
                key.id
            )));
        }
        self.last_key_id = self.last_key_id.max(key.id);
        self.keys.insert(key.id, key);
        Ok(())
    }

    fn keys(&self, keyset: &str) -> Vec<KeyRecord> {
        self.keys
            .values()
            .filter(|k| k.keyset == keyset)
            .cloned()
            .collect()
    }
}
