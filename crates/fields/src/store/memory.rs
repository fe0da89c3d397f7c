//! [`MemoryKeysetStore`]: process-local keyset store for tests and ephemeral use.

use std::sync::{Arc, Mutex, MutexGuard};

use common::KeysetError;

use super::{KeyRecord, KeysetRecord, KeysetStore, StoreState};

/// Thread-safe in-memory store.
///
/// Clones share the same underlying records.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeysetStore {
    inner: Arc<Mutex<StoreState>>,
}

impl MemoryKeysetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, KeysetError> {
        self.inner
            .lock()
            .map_err(|e| KeysetError::Io(format!("keyset store lock poisoned: {e}")))
    }
}

impl KeysetStore for MemoryKeysetStore {
    fn get_keyset(&self, name: &str) -> Result<KeysetRecord, KeysetError> {
        self.lock()?.get_keyset(name)
    }

    fn list_keysets(&self) -> Result<Vec<KeysetRecord>, KeysetError> {
        Ok(self.lock()?.list_keysets())
    }

    fn insert_keyset(&self, name: &str) -> Result<KeysetRecord, KeysetError> {
        self.lock()?.insert_keyset(name)
    }

    fn set_primary(&self, name: &str, key_id: u32) -> Result<(), KeysetError> {
        self.lock()?.set_primary(name, key_id)
    }

    fn delete_keyset(&self, name: &str) -> Result<(), KeysetError> {
        self.lock()?.delete_keyset(name)
    }

    fn next_key_id(&self) -> Result<u32, KeysetError> {
        Ok(self.lock()?.next_key_id())
    }

    fn insert_key(&self, key: KeyRecord) -> Result<(), KeysetError> {
        self.lock()?.insert_key(key)
    }

    fn keys(&self, keyset: &str) -> Result<Vec<KeyRecord>, KeysetError> {
        Ok(self.lock()?.keys(keyset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{KeyStatus, OutputPrefixType};

    fn key(id: u32, keyset: &str) -> KeyRecord {
        KeyRecord {
            id,
            keyset: keyset.into(),
            type_url: "sealfield.AesGcmSivKey".into(),
            key_data: vec![1, 2, 3],
            status: KeyStatus::Enabled,
            output_prefix_type: OutputPrefixType::Tink,
            output_prefix: vec![1, 0, 0, 0, id as u8],
        }
    }

    #[test]
    fn initially_empty() {
        let store = MemoryKeysetStore::new();
        assert!(store.list_keysets().unwrap().is_empty());
        assert!(matches!(store.get_keyset("aead"), Err(KeysetError::NotFound(_))));
    }

    #[test]
    fn insert_and_retrieve() {
        let store = MemoryKeysetStore::new();
        store.insert_keyset("aead").unwrap();
        let id = store.next_key_id().unwrap();
        store.insert_key(key(id, "aead")).unwrap();
        store.set_primary("aead", id).unwrap();

        assert_eq!(store.get_keyset("aead").unwrap().primary_key_id, Some(id));
        assert_eq!(store.keys("aead").unwrap().len(), 1);
        assert_eq!(
            store.keys_with_prefix("aead", &[1, 0, 0, 0, id as u8]).unwrap().len(),
            1
        );
        assert!(store.keys_with_prefix("aead", &[]).unwrap().is_empty());
    }

    #[test]
    fn names_are_unique() {
        let store = MemoryKeysetStore::new();
        store.insert_keyset("aead").unwrap();
        assert!(store.insert_keyset("aead").is_err());
    }

    #[test]
    fn key_ids_are_not_reused() {
        let store = MemoryKeysetStore::new();
        let a = store.next_key_id().unwrap();
        let b = store.next_key_id().unwrap();
        assert!(b > a);
    }

    #[test]
    fn set_primary_requires_key_of_keyset() {
        let store = MemoryKeysetStore::new();
        store.insert_keyset("a").unwrap();
        store.insert_keyset("b").unwrap();
        store.insert_key(key(1, "a")).unwrap();
        assert!(matches!(store.set_primary("b", 1), Err(KeysetError::NotFound(_))));
    }

    #[test]
    fn delete_cascades_to_keys() {
        let store = MemoryKeysetStore::new();
        store.insert_keyset("aead").unwrap();
        store.insert_key(key(1, "aead")).unwrap();
        store.delete_keyset("aead").unwrap();
        assert!(store.keys("aead").unwrap().is_empty());
        assert!(store.delete_keyset("aead").is_err());
    }

    #[test]
    fn clones_share_state() {
        let store = MemoryKeysetStore::new();
        let other = store.clone();
        store.insert_keyset("shared").unwrap();
        assert!(other.get_keyset("shared").is_ok());
    }
}
