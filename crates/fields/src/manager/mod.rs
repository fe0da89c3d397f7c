//! Keyset loading and caching.
//!
//! # Responsibilities
//!
//! - Resolve a keyset name through [`FieldsConfig`] to a keyset file or a
//!   keyset held in the keyset store.
//! - Load each keyset once and hand out the same primitive afterwards.
//! - Refuse to hand out a primitive of the wrong family.
//!
//! # Module invariants
//!
//! - The store's protection keyset is always file-based. A database keyset
//!   protected by another database keyset would need the store to decrypt
//!   itself.

pub mod cache;

pub use cache::{CachedKeyset, HandleCache};

use std::sync::Arc;

use common::templates::{AES_GCM_SIV_TYPE_URL, AES_SIV_TYPE_URL};
use common::{KeysetError, PrimitiveFamily};
use tracing::{debug, info};

use crate::config::{keyset_key, FieldsConfig};
use crate::crypto::Aead;
use crate::keyset::{KeySource, KeysetAead, KeysetDeterministicAead, KeysetHandle};
use crate::store::{DatabaseKeyset, JsonFileKeysetStore, KeysetStore};

/// Entry point for obtaining keyset primitives by name.
#[derive(Clone)]
pub struct KeysetManager {
    config: Arc<FieldsConfig>,
    store: Option<Arc<dyn KeysetStore>>,
    cache: HandleCache,
}

impl std::fmt::Debug for KeysetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysetManager")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "<store>"))
            .field("cache", &self.cache)
            .finish()
    }
}

impl KeysetManager {
    /// Build a manager. A configured `[store]` is opened as a JSON file store.
    pub fn new(config: FieldsConfig) -> Self {
        let store = config
            .store
            .as_ref()
            .map(|s| Arc::new(JsonFileKeysetStore::new(&s.path)) as Arc<dyn KeysetStore>);
        Self {
            config: Arc::new(config),
            store,
            cache: HandleCache::new(),
        }
    }

    /// Build a manager over an explicit keyset store.
    pub fn with_store(config: FieldsConfig, store: Arc<dyn KeysetStore>) -> Self {
        Self {
            config: Arc::new(config),
            store: Some(store),
            cache: HandleCache::new(),
        }
    }

    pub fn config(&self) -> &FieldsConfig {
        &self.config
    }

    /// The keyset store, if one is configured.
    pub fn store(&self) -> Option<Arc<dyn KeysetStore>> {
        self.store.clone()
    }

    /// Randomised AEAD for keyset `name`, loaded on first use.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::ImproperlyConfigured`] for configuration problems
    /// and [`KeysetError::UnsupportedPrimitive`] if the keyset holds
    /// deterministic keys.
    pub fn aead(&self, name: &str) -> Result<Arc<KeysetAead>, KeysetError> {
        match self.get_or_load(name)? {
            CachedKeyset::Aead(aead) => Ok(aead),
            CachedKeyset::Deterministic(_) => Err(unsupported(PrimitiveFamily::Aead, AES_SIV_TYPE_URL)),
        }
    }

    /// Deterministic AEAD for keyset `name`, loaded on first use.
    ///
    /// # Errors
    ///
    /// As [`Self::aead`], with the families reversed.
    pub fn deterministic_aead(&self, name: &str) -> Result<Arc<KeysetDeterministicAead>, KeysetError> {
        match self.get_or_load(name)? {
            CachedKeyset::Deterministic(daead) => Ok(daead),
            CachedKeyset::Aead(_) => {
                Err(unsupported(PrimitiveFamily::DeterministicAead, AES_GCM_SIV_TYPE_URL))
            }
        }
    }

    /// The AEAD protecting key material inside the keyset store.
    pub fn protection_aead(&self) -> Result<Arc<dyn Aead>, KeysetError> {
        let name = self.config.protection_keyset();
        if self.config.keyset(&name)?.is_database() {
            return Err(KeysetError::ImproperlyConfigured(format!(
                "protection keyset `{name}` must not itself be stored in the database"
            )));
        }
        let aead: Arc<dyn Aead> = self.aead(&name)?;
        Ok(aead)
    }

    /// Open a keyset held in the store, bypassing the cache.
    pub fn database_keyset(&self, db_name: &str) -> Result<DatabaseKeyset, KeysetError> {
        DatabaseKeyset::open(self.require_store()?, self.protection_aead()?, db_name)
    }

    /// Forget a loaded keyset so the next request reloads it.
    pub fn invalidate(&self, name: &str) -> bool {
        let removed = self.cache.remove(&keyset_key(name));
        if removed {
            debug!(keyset = %name, "keyset evicted from cache");
        }
        removed
    }

    /// Number of keysets loaded so far.
    pub fn loaded(&self) -> usize {
        self.cache.len()
    }

    /// Names of the keysets loaded so far, sorted.
    pub fn loaded_names(&self) -> Vec<String> {
        self.cache.names()
    }

    fn get_or_load(&self, name: &str) -> Result<CachedKeyset, KeysetError> {
        let name = keyset_key(name);
        if let Some(hit) = self.cache.get(&name) {
            return Ok(hit);
        }
        let loaded = self.load(&name)?;
        Ok(self.cache.insert(&name, loaded))
    }

    fn load(&self, name: &str) -> Result<CachedKeyset, KeysetError> {
        let cfg = self.config.keyset(name)?;
        cfg.validate()?;

        let source: Arc<dyn KeySource> = match cfg.db_name.as_deref().filter(|n| !n.is_empty()) {
            Some(db_name) => Arc::new(self.database_keyset(db_name)?),
            None => {
                // validate() guarantees a path for non-database keysets.
                let path = cfg.path.as_ref().ok_or_else(|| {
                    KeysetError::ImproperlyConfigured("Keyset path or db_name must be set".into())
                })?;
                let json = std::fs::read_to_string(path)?;
                let handle = match cfg.master_key()? {
                    Some(master) => KeysetHandle::read_encrypted(&json, master.as_ref())?,
                    None => KeysetHandle::read_cleartext(&json)?,
                };
                Arc::new(handle.primitive_set()?)
            }
        };

        let family = source.family()?;
        info!(
            keyset = %name,
            family = family.describe(),
            database = cfg.is_database(),
            "keyset loaded"
        );
        Ok(match family {
            PrimitiveFamily::Aead => CachedKeyset::Aead(Arc::new(KeysetAead::new(source)?)),
            PrimitiveFamily::DeterministicAead => {
                CachedKeyset::Deterministic(Arc::new(KeysetDeterministicAead::new(source)?))
            }
        })
    }

    fn require_store(&self) -> Result<Arc<dyn KeysetStore>, KeysetError> {
        self.store.clone().ok_or_else(|| {
            KeysetError::ImproperlyConfigured(
                "Database keysets require a configured keyset store".into(),
            )
        })
    }
}

fn unsupported(expected: PrimitiveFamily, type_url: &str) -> KeysetError {
    KeysetError::UnsupportedPrimitive {
        expected: expected.describe(),
        type_url: type_url.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeysetConfig, StoreConfig};
    use crate::crypto::DeterministicAead;
    use crate::store::MemoryKeysetStore;
    use common::KeyTemplate;
    use std::path::Path;

    fn write_keyset(dir: &Path, file: &str, template: &str) -> std::path::PathBuf {
        let t = KeyTemplate::from_name(template).unwrap();
        let path = dir.join(file);
        std::fs::write(&path, KeysetHandle::generate(&t).write_cleartext().unwrap()).unwrap();
        path
    }

    #[test]
    fn same_primitive_on_repeated_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_keyset(dir.path(), "default.json", "AES256_GCM_SIV");
        let manager =
            KeysetManager::new(FieldsConfig::new().with_keyset("default", KeysetConfig::cleartext_file(path)));

        let a = manager.aead("default").unwrap();
        let b = manager.aead("default").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.loaded(), 1);
        assert_eq!(manager.loaded_names(), vec!["default".to_string()]);
    }

    #[test]
    fn names_differing_in_case_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_keyset(dir.path(), "customers.json", "AES256_GCM_SIV");
        let manager =
            KeysetManager::new(FieldsConfig::new().with_keyset("Customers", KeysetConfig::cleartext_file(path)));

        let a = manager.aead("Customers").unwrap();
        let b = manager.aead("customers").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.loaded_names(), vec!["customers".to_string()]);
        assert!(manager.invalidate("CUSTOMERS"));
    }

    #[test]
    fn wrong_family_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_keyset(dir.path(), "default.json", "AES256_GCM_SIV");
        let manager =
            KeysetManager::new(FieldsConfig::new().with_keyset("default", KeysetConfig::cleartext_file(path)));
        assert!(matches!(
            manager.deterministic_aead("default"),
            Err(KeysetError::UnsupportedPrimitive { .. })
        ));
    }

    #[test]
    fn unknown_keyset() {
        let manager = KeysetManager::new(FieldsConfig::new());
        assert!(matches!(
            manager.aead("default"),
            Err(KeysetError::ImproperlyConfigured(m)) if m == "Could not find any keyset configuration"
        ));
    }

    #[test]
    fn invalidate_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_keyset(dir.path(), "default.json", "AES256_GCM_SIV");
        let manager =
            KeysetManager::new(FieldsConfig::new().with_keyset("default", KeysetConfig::cleartext_file(path)));
        let a = manager.aead("default").unwrap();
        assert!(manager.invalidate("default"));
        assert!(!manager.invalidate("default"));
        let b = manager.aead("default").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn database_keyset_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let protection = write_keyset(dir.path(), "db_keyset.json", "AES256_GCM_SIV");
        let store = Arc::new(MemoryKeysetStore::new());
        let config = FieldsConfig::new()
            .with_keyset("db_keyset", KeysetConfig::cleartext_file(protection))
            .with_keyset("customers", KeysetConfig::database("customers"));
        let manager = KeysetManager::with_store(config, store.clone());

        DatabaseKeyset::create(
            store,
            manager.protection_aead().unwrap(),
            "customers",
            &KeyTemplate::from_name("AES256_SIV").unwrap(),
        )
        .unwrap();

        let daead = manager.deterministic_aead("customers").unwrap();
        let ct = daead.encrypt_deterministically(b"alice", b"").unwrap();
        assert_eq!(daead.decrypt_deterministically(&ct, b"").unwrap(), b"alice");
    }

    #[test]
    fn database_keyset_requires_store() {
        let config = FieldsConfig::new().with_keyset("customers", KeysetConfig::database("customers"));
        let manager = KeysetManager::new(config);
        assert!(matches!(
            manager.deterministic_aead("customers"),
            Err(KeysetError::ImproperlyConfigured(_))
        ));
    }

    #[test]
    fn protection_keyset_must_be_file_based() {
        let config = FieldsConfig::new()
            .with_keyset("db_keyset", KeysetConfig::database("db_keyset"))
            .with_store(StoreConfig::new("unused.json"));
        let manager = KeysetManager::new(config);
        assert!(matches!(
            manager.protection_aead(),
            Err(KeysetError::ImproperlyConfigured(_))
        ));
    }
}
