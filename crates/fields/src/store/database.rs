//! [`DatabaseKeyset`]: a keyset whose keys live in a [`KeysetStore`].
//!
//! Keys are decrypted and instantiated on first use and cached by id. A
//! ciphertext whose prefix matches a cached key is served without touching
//! the store. The
//! primary key id is read from the store on every call so that promotions
//! made by another process (or the key-management tool) take effect
//! immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use common::{Key, KeyData, KeyStatus, KeyTemplate, Keyset, KeysetError, KeysetInfo, PrimitiveFamily};
use tracing::{info, instrument};

use super::{KeyRecord, KeysetStore};
use crate::crypto::Aead;
use crate::keyset::{new_key_data, output_prefix, Entry, KeySource};

/// Keyset backed by store records.
pub struct DatabaseKeyset {
    name: String,
    store: Arc<dyn KeysetStore>,
    protection: Arc<dyn Aead>,
    cache: Mutex<HashMap<u32, Entry>>,
}

impl std::fmt::Debug for DatabaseKeyset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseKeyset")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl DatabaseKeyset {
    /// Open an existing keyset.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::NotFound`] if the store has no keyset called `name`.
    pub fn open(
        store: Arc<dyn KeysetStore>,
        protection: Arc<dyn Aead>,
        name: &str,
    ) -> Result<Self, KeysetError> {
        store.get_keyset(name)?;
        Ok(Self {
            name: name.to_owned(),
            store,
            protection,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Create a keyset with one primary key generated from `template`.
    ///
    /// If the key cannot be created the empty keyset is removed again.
    pub fn create(
        store: Arc<dyn KeysetStore>,
        protection: Arc<dyn Aead>,
        name: &str,
        template: &KeyTemplate,
    ) -> Result<Self, KeysetError> {
        store.insert_keyset(name)?;
        let keyset = Self::open(store.clone(), protection, name)?;

        let created = keyset
            .generate_key(template)
            .and_then(|key| keyset.set_primary_key(key.id));
        if let Err(e) = created {
            // Best effort: the original error is what the caller needs to see.
            let _ = store.delete_keyset(name);
            return Err(e);
        }
        info!(keyset = %name, template = template.name, "keyset created");
        Ok(keyset)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create and store a new, non-primary key.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::ImproperlyConfigured`] if `template` belongs to a
    /// different primitive family than the keys already in the keyset.
    #[instrument(skip_all, fields(keyset = %self.name, template = template.name))]
    pub fn generate_key(&self, template: &KeyTemplate) -> Result<KeyRecord, KeysetError> {
        if let Some(existing) = self.stored_family()? {
            if existing != template.family() {
                return Err(KeysetError::ImproperlyConfigured(format!(
                    "keyset `{}` holds {} keys; template `{}` is {}",
                    self.name,
                    existing.describe(),
                    template.name,
                    template.family().describe()
                )));
            }
        }

        let id = self.store.next_key_id()?;
        let key_data = new_key_data(template);
        let serialised = serde_json::to_vec(&key_data)?;
        let record = KeyRecord {
            id,
            keyset: self.name.clone(),
            type_url: key_data.type_url.clone(),
            key_data: self.protection.encrypt(&serialised, &self.key_aad(id))?,
            status: KeyStatus::Enabled,
            output_prefix_type: template.output_prefix_type,
            output_prefix: output_prefix(id, template.output_prefix_type),
        };
        self.store.insert_key(record.clone())?;
        info!(key_id = id, "key created");
        Ok(record)
    }

    /// Promote a key of this keyset to primary.
    pub fn set_primary_key(&self, key_id: u32) -> Result<(), KeysetError> {
        let key = self
            .store
            .keys(&self.name)?
            .into_iter()
            .find(|k| k.id == key_id)
            .ok_or_else(|| KeysetError::NotFound(format!("Key ID {key_id} not found in keyset")))?;
        if key.status != KeyStatus::Enabled {
            return Err(KeysetError::ImproperlyConfigured(format!(
                "key {key_id} is not enabled"
            )));
        }
        self.store.set_primary(&self.name, key_id)?;
        info!(keyset = %self.name, key_id, "primary key promoted");
        Ok(())
    }

    pub fn primary_key_id(&self) -> Result<Option<u32>, KeysetError> {
        Ok(self.store.get_keyset(&self.name)?.primary_key_id)
    }

    /// Key records of this keyset, ordered by id.
    pub fn keys(&self) -> Result<Vec<KeyRecord>, KeysetError> {
        self.store.keys(&self.name)
    }

    /// Export the keyset including decrypted key material.
    pub fn export_keyset(&self) -> Result<Keyset, KeysetError> {
        let primary_key_id = self.require_primary()?;
        let key = self
            .keys()?
            .iter()
            .map(|record| {
                Ok(Key {
                    key_id: record.id,
                    status: record.status,
                    output_prefix_type: record.output_prefix_type,
                    key_data: self.unprotect(record)?,
                })
            })
            .collect::<Result<Vec<_>, KeysetError>>()?;
        Ok(Keyset { primary_key_id, key })
    }

    /// Export the keyset metadata only.
    pub fn export_keyset_info(&self) -> Result<KeysetInfo, KeysetError> {
        let primary_key_id = self.require_primary()?;
        Ok(KeysetInfo {
            primary_key_id,
            key_info: self
                .keys()?
                .iter()
                .map(|record| common::protocol::KeyInfo {
                    type_url: record.type_url.clone(),
                    status: record.status,
                    key_id: record.id,
                    output_prefix_type: record.output_prefix_type,
                })
                .collect(),
        })
    }

    fn stored_family(&self) -> Result<Option<PrimitiveFamily>, KeysetError> {
        Ok(self
            .keys()?
            .first()
            .and_then(|k| PrimitiveFamily::of_type_url(&k.type_url)))
    }

    fn require_primary(&self) -> Result<u32, KeysetError> {
        self.primary_key_id()?.ok_or_else(|| {
            KeysetError::Malformed(format!("keyset `{}` has no primary key", self.name))
        })
    }

    fn key_aad(&self, key_id: u32) -> Vec<u8> {
        format!("{}:{}", self.name, key_id).into_bytes()
    }

    fn unprotect(&self, record: &KeyRecord) -> Result<KeyData, KeysetError> {
        let serialised = self
            .protection
            .decrypt(&record.key_data, &self.key_aad(record.id))?;
        Ok(serde_json::from_slice(&serialised)?)
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, HashMap<u32, Entry>>, KeysetError> {
        self.cache
            .lock()
            .map_err(|e| KeysetError::Io(format!("key cache lock poisoned: {e}")))
    }

    /// Decrypt and cache every record not cached yet.
    fn cache_records(&self, records: Vec<KeyRecord>) -> Result<(), KeysetError> {
        let mut cache = self.lock_cache()?;
        for record in records {
            if cache.contains_key(&record.id) {
                continue;
            }
            let key = Key {
                key_id: record.id,
                status: record.status,
                output_prefix_type: record.output_prefix_type,
                key_data: self.unprotect(&record)?,
            };
            cache.insert(record.id, Entry::from_key(&key)?);
        }
        Ok(())
    }

    fn cached_ids(&self) -> Result<Vec<u32>, KeysetError> {
        Ok(self.lock_cache()?.keys().copied().collect())
    }
}

impl KeySource for DatabaseKeyset {
    fn primary(&self) -> Result<Entry, KeysetError> {
        let primary_id = self.require_primary()?;
        if let Some(entry) = self.lock_cache()?.get(&primary_id) {
            return Ok(entry.clone());
        }

        let record = self
            .keys()?
            .into_iter()
            .find(|k| k.id == primary_id)
            .ok_or_else(|| KeysetError::NotFound(format!("primary key {primary_id} missing")))?;
        self.cache_records(vec![record])?;
        self.lock_cache()?
            .get(&primary_id)
            .cloned()
            .ok_or_else(|| KeysetError::NotFound(format!("primary key {primary_id} missing")))
    }

    fn entries_for_prefix(&self, prefix: &[u8]) -> Result<Vec<Entry>, KeysetError> {
        // A TINK prefix names exactly one key id, so a cached key is the whole answer.
        if !prefix.is_empty() {
            let cache = self.lock_cache()?;
            if cache.values().any(|e| e.prefix == prefix) {
                return Ok(cache
                    .values()
                    .filter(|e| e.prefix == prefix && e.status == KeyStatus::Enabled)
                    .cloned()
                    .collect());
            }
        }

        let cached = self.cached_ids()?;
        let missing = self
            .store
            .keys_with_prefix(&self.name, prefix)?
            .into_iter()
            .filter(|k| !cached.contains(&k.id))
            .collect();
        self.cache_records(missing)?;

        Ok(self
            .lock_cache()?
            .values()
            .filter(|e| e.prefix == prefix && e.status == KeyStatus::Enabled)
            .cloned()
            .collect())
    }

    fn all(&self) -> Result<Vec<Entry>, KeysetError> {
        let cached = self.cached_ids()?;
        let missing = self
            .keys()?
            .into_iter()
            .filter(|k| !cached.contains(&k.id))
            .collect();
        self.cache_records(missing)?;

        Ok(self
            .lock_cache()?
            .values()
            .filter(|e| e.status == KeyStatus::Enabled)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DeterministicAead;
    use crate::keyset::{KeysetDeterministicAead, KeysetHandle};
    use crate::store::MemoryKeysetStore;

    fn protection() -> Arc<dyn Aead> {
        let t = KeyTemplate::from_name("AES256_GCM_SIV").unwrap();
        Arc::new(KeysetHandle::generate(&t).aead().unwrap())
    }

    fn template(name: &str) -> KeyTemplate {
        KeyTemplate::from_name(name).unwrap()
    }

    #[test]
    fn create_sets_primary() {
        let store: Arc<dyn KeysetStore> = Arc::new(MemoryKeysetStore::new());
        let ks = DatabaseKeyset::create(store.clone(), protection(), "daead", &template("AES256_SIV"))
            .unwrap();
        let keys = ks.keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(ks.primary_key_id().unwrap(), Some(keys[0].id));
        assert_eq!(ks.primary().unwrap().key_id, keys[0].id);
    }

    #[test]
    fn key_material_is_protected() {
        let store = Arc::new(MemoryKeysetStore::new());
        let prot = protection();
        let ks = DatabaseKeyset::create(store.clone(), prot.clone(), "aead", &template("AES256_GCM_SIV"))
            .unwrap();
        let exported = ks.export_keyset().unwrap();
        let raw = &exported.key[0].key_data.value;
        let record = &store.keys("aead").unwrap()[0];
        assert!(!record
            .key_data
            .windows(raw.len())
            .any(|w| w == raw.as_slice()));

        // A different protection key cannot read the material.
        let other = DatabaseKeyset::open(store, protection(), "aead").unwrap();
        assert!(matches!(other.primary(), Err(KeysetError::Crypto(_))));
    }

    #[test]
    fn mixed_family_rejected() {
        let store = Arc::new(MemoryKeysetStore::new());
        let ks = DatabaseKeyset::create(store, protection(), "aead", &template("AES256_GCM_SIV")).unwrap();
        assert!(matches!(
            ks.generate_key(&template("AES256_SIV")),
            Err(KeysetError::ImproperlyConfigured(_))
        ));
    }

    #[test]
    fn duplicate_create_fails() {
        let store: Arc<dyn KeysetStore> = Arc::new(MemoryKeysetStore::new());
        let prot = protection();
        DatabaseKeyset::create(store.clone(), prot.clone(), "aead", &template("AES256_GCM_SIV")).unwrap();
        assert!(DatabaseKeyset::create(store, prot, "aead", &template("AES256_GCM_SIV")).is_err());
    }

    #[test]
    fn open_missing_keyset() {
        let store = Arc::new(MemoryKeysetStore::new());
        assert!(matches!(
            DatabaseKeyset::open(store, protection(), "nope"),
            Err(KeysetError::NotFound(_))
        ));
    }

    #[test]
    fn promotion_seen_by_open_handle() {
        let store: Arc<dyn KeysetStore> = Arc::new(MemoryKeysetStore::new());
        let prot = protection();
        let ks = Arc::new(
            DatabaseKeyset::create(store.clone(), prot.clone(), "daead", &template("AES256_SIV"))
                .unwrap(),
        );
        let daead = KeysetDeterministicAead::new(ks.clone()).unwrap();
        let old = daead.encrypt_deterministically(b"12345678", b"").unwrap();

        // Rotate through a second handle, as the key tool would.
        let admin = DatabaseKeyset::open(store, prot, "daead").unwrap();
        let new_key = admin.generate_key(&template("AES256_SIV")).unwrap();
        admin.set_primary_key(new_key.id).unwrap();

        let new = daead.encrypt_deterministically(b"12345678", b"").unwrap();
        assert_ne!(old, new);
        assert_eq!(new[1..5], new_key.id.to_be_bytes());
        assert_eq!(daead.decrypt_deterministically(&old, b"").unwrap(), b"12345678");
        let candidates = daead.encrypt_with_all_keys(b"12345678", b"").unwrap();
        assert!(candidates.contains(&old));
        assert!(candidates.contains(&new));
    }

    #[test]
    fn export_info_lists_keys() {
        let store = Arc::new(MemoryKeysetStore::new());
        let ks = DatabaseKeyset::create(store, protection(), "aead", &template("AES256_GCM_SIV")).unwrap();
        ks.generate_key(&template("AES128_GCM_SIV")).unwrap();
        let info = ks.export_keyset_info().unwrap();
        assert_eq!(info.key_info.len(), 2);
        assert_eq!(Some(info.primary_key_id), ks.primary_key_id().unwrap());
        let exported = ks.export_keyset().unwrap();
        assert!(KeysetHandle::from_keyset(exported).is_ok());
    }

    #[test]
    fn promote_unknown_key() {
        let store = Arc::new(MemoryKeysetStore::new());
        let ks = DatabaseKeyset::create(store, protection(), "aead", &template("AES256_GCM_SIV")).unwrap();
        assert!(matches!(ks.set_primary_key(999), Err(KeysetError::NotFound(_))));
    }

    /// Memory store that counts key reads.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryKeysetStore,
        key_reads: std::sync::atomic::AtomicUsize,
    }

    impl CountingStore {
        fn reads(&self) -> usize {
            self.key_reads.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl KeysetStore for CountingStore {
        fn get_keyset(&self, name: &str) -> Result<crate::store::KeysetRecord, KeysetError> {
            self.inner.get_keyset(name)
        }
        fn list_keysets(&self) -> Result<Vec<crate::store::KeysetRecord>, KeysetError> {
            self.inner.list_keysets()
        }
        fn insert_keyset(&self, name: &str) -> Result<crate::store::KeysetRecord, KeysetError> {
            self.inner.insert_keyset(name)
        }
        fn set_primary(&self, name: &str, key_id: u32) -> Result<(), KeysetError> {
            self.inner.set_primary(name, key_id)
        }
        fn delete_keyset(&self, name: &str) -> Result<(), KeysetError> {
            self.inner.delete_keyset(name)
        }
        fn next_key_id(&self) -> Result<u32, KeysetError> {
            self.inner.next_key_id()
        }
        fn insert_key(&self, key: KeyRecord) -> Result<(), KeysetError> {
            self.inner.insert_key(key)
        }
        fn keys(&self, keyset: &str) -> Result<Vec<KeyRecord>, KeysetError> {
            self.key_reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.keys(keyset)
        }
    }

    #[test]
    fn cached_prefix_decrypts_without_store_reads() {
        let store = Arc::new(CountingStore::default());
        let ks = Arc::new(
            DatabaseKeyset::create(store.clone(), protection(), "daead", &template("AES256_SIV"))
                .unwrap(),
        );
        let daead = KeysetDeterministicAead::new(ks).unwrap();
        let ct = daead.encrypt_deterministically(b"alice@example.com", b"").unwrap();

        let before = store.reads();
        for _ in 0..10 {
            assert_eq!(
                daead.decrypt_deterministically(&ct, b"").unwrap(),
                b"alice@example.com"
            );
        }
        assert_eq!(store.reads(), before);

        // An unknown key id is looked up in the store.
        let mut unknown = ct.clone();
        unknown[1..5].copy_from_slice(&999u32.to_be_bytes());
        assert!(daead.decrypt_deterministically(&unknown, b"").is_err());
        assert!(store.reads() > before);
    }
}
