//! Keyset configuration: which keysets exist and where their material lives.
//!
//! Configuration is read from a TOML file and then overlaid with environment
//! variables (`SEALFIELD_LOG_LEVEL`, `SEALFIELD_KEYSETS__DEFAULT__PATH`, ...).
//! Master keys that are not files (a KMS adapter, an in-process key) are
//! attached programmatically with [`KeysetConfig::with_master_key_aead`].
//!
//! ```toml
//! log_level = "info"
//!
//! [keysets.default]
//! cleartext = true
//! path = "keysets/default.json"
//!
//! [keysets.customers]
//! db_name = "customers"
//!
//! [store]
//! path = "keystore.json"
//! protection_keyset = "db_keyset"
//! ```
//!
//! Keyset names are case-insensitive. The `config` crate lowercases table
//! keys, so every name is stored and looked up in lowercase.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use common::KeysetError;
use serde::Deserialize;

use crate::crypto::Aead;
use crate::keyset::KeysetHandle;

/// Name of the keyset used when a field does not pick one.
pub const DEFAULT_KEYSET: &str = "default";

/// Canonical form of a keyset name, matching how `config` stores table keys.
pub(crate) fn keyset_key(name: &str) -> String {
    name.to_lowercase()
}

/// Where one named keyset comes from.
#[derive(Clone, Default, Deserialize)]
pub struct KeysetConfig {
    /// JSON keyset file.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Name of a keyset held in the keyset store.
    #[serde(default)]
    pub db_name: Option<String>,

    /// Whether the file at `path` holds an unencrypted keyset.
    #[serde(default)]
    pub cleartext: bool,

    /// Cleartext AEAD keyset file used as the master key of an encrypted keyset.
    #[serde(default)]
    pub master_key_path: Option<PathBuf>,

    /// Master key supplied in code. Takes precedence over `master_key_path`.
    #[serde(skip)]
    pub master_key_aead: Option<Arc<dyn Aead>>,
}

impl fmt::Debug for KeysetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysetConfig")
            .field("path", &self.path)
            .field("db_name", &self.db_name)
            .field("cleartext", &self.cleartext)
            .field("master_key_path", &self.master_key_path)
            .field("master_key_aead", &self.master_key_aead.as_ref().map(|_| "<aead>"))
            .finish()
    }
}

impl KeysetConfig {
    /// A cleartext keyset file.
    pub fn cleartext_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            cleartext: true,
            ..Self::default()
        }
    }

    /// An encrypted keyset file, unwrapped by `master`.
    pub fn encrypted_file(path: impl Into<PathBuf>, master: Arc<dyn Aead>) -> Self {
        Self {
            path: Some(path.into()),
            master_key_aead: Some(master),
            ..Self::default()
        }
    }

    /// A keyset held in the keyset store under `name`.
    pub fn database(name: impl Into<String>) -> Self {
        Self {
            db_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_master_key_aead(mut self, master: Arc<dyn Aead>) -> Self {
        self.master_key_aead = Some(master);
        self
    }

    pub fn is_database(&self) -> bool {
        self.db_name.as_deref().is_some_and(|n| !n.is_empty())
    }

    /// Check that exactly one source is named and that file keysets can be read.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::ImproperlyConfigured`] describing the first problem.
    pub fn validate(&self) -> Result<(), KeysetError> {
        let path = self.path.as_ref().filter(|p| !p.as_os_str().is_empty());
        let db_name = self.db_name.as_deref().filter(|n| !n.is_empty());

        match (path, db_name) {
            (None, None) => Err(KeysetError::ImproperlyConfigured(
                "Keyset path or db_name must be set".into(),
            )),
            (Some(_), Some(_)) => Err(KeysetError::ImproperlyConfigured(
                "Only one of keyset path or db_name must be set".into(),
            )),
            (Some(path), None) => {
                if !path.exists() {
                    return Err(KeysetError::ImproperlyConfigured(format!(
                        "Keyset {} does not exist",
                        path.display()
                    )));
                }
                if !self.cleartext
                    && self.master_key_aead.is_none()
                    && self.master_key_path.is_none()
                {
                    return Err(KeysetError::ImproperlyConfigured(
                        "Encrypted keysets must specify `master_key_aead`".into(),
                    ));
                }
                Ok(())
            }
            (None, Some(_)) => Ok(()),
        }
    }

    /// Resolve the master key of an encrypted keyset.
    ///
    /// Returns `None` for cleartext keysets.
    pub fn master_key(&self) -> Result<Option<Arc<dyn Aead>>, KeysetError> {
        if self.cleartext {
            return Ok(None);
        }
        if let Some(master) = &self.master_key_aead {
            return Ok(Some(master.clone()));
        }
        match &self.master_key_path {
            Some(path) => {
                let json = std::fs::read_to_string(path)?;
                let aead = KeysetHandle::read_cleartext(&json)?.aead()?;
                Ok(Some(Arc::new(aead)))
            }
            None => Ok(None),
        }
    }

    fn resolve_relative(&mut self, base: &Path) {
        for p in [&mut self.path, &mut self.master_key_path].into_iter().flatten() {
            if p.is_relative() && !p.as_os_str().is_empty() {
                *p = base.join(&*p);
            }
        }
    }
}

/// Location of the keyset store backing `db_name` keysets.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON document holding keyset and key records.
    pub path: PathBuf,

    /// Keyset that encrypts key material inside the store.
    #[serde(default = "default_protection_keyset")]
    pub protection_keyset: String,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            protection_keyset: default_protection_keyset(),
        }
    }
}

/// Complete configuration: named keysets plus the optional keyset store.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldsConfig {
    #[serde(default)]
    pub keysets: HashMap<String, KeysetConfig>,

    #[serde(default)]
    pub store: Option<StoreConfig>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_protection_keyset() -> String {
    "db_keyset".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for FieldsConfig {
    fn default() -> Self {
        Self {
            keysets: HashMap::new(),
            store: None,
            log_level: default_log_level(),
        }
    }
}

impl FieldsConfig {
    /// Start an empty configuration to be filled with [`Self::with_keyset`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyset(mut self, name: impl Into<String>, keyset: KeysetConfig) -> Self {
        let name: String = name.into();
        self.keysets.insert(keyset_key(&name), keyset);
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = Some(store);
        self
    }

    /// Load configuration from a TOML file, overlaid with environment variables.
    ///
    /// Relative keyset paths are resolved against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not deserialise.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::load_file(path, environment(None))
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self> {
        Self::load_env(environment(None))
    }

    fn load_file(path: &Path, env: config::Environment) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(env)
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        let mut c: FieldsConfig = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        if let Some(base) = path.parent() {
            c.resolve_relative(base);
        }
        Ok(c.normalized())
    }

    fn load_env(env: config::Environment) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(env)
            .build()
            .context("failed to build configuration from environment")?;

        let c: FieldsConfig = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;
        Ok(c.normalized())
    }

    fn normalized(mut self) -> Self {
        self.keysets = self
            .keysets
            .into_iter()
            .map(|(name, keyset)| (keyset_key(&name), keyset))
            .collect();
        self
    }

    /// Look up the configuration of a named keyset.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::ImproperlyConfigured`] if no keysets are
    /// configured at all or `name` is not among them.
    pub fn keyset(&self, name: &str) -> Result<&KeysetConfig, KeysetError> {
        if self.keysets.is_empty() {
            return Err(KeysetError::ImproperlyConfigured(
                "Could not find any keyset configuration".into(),
            ));
        }
        self.keysets.get(&keyset_key(name)).ok_or_else(|| {
            KeysetError::ImproperlyConfigured(format!(
                "Could not find configuration for keyset `{name}`"
            ))
        })
    }

    /// The configured store's protection keyset name.
    pub fn protection_keyset(&self) -> String {
        self.store
            .as_ref()
            .map(|s| keyset_key(&s.protection_keyset))
            .unwrap_or_else(default_protection_keyset)
    }

    fn resolve_relative(&mut self, base: &Path) {
        for keyset in self.keysets.values_mut() {
            keyset.resolve_relative(base);
        }
        if let Some(store) = &mut self.store {
            if store.path.is_relative() {
                store.path = base.join(&store.path);
            }
        }
    }
}

/// `SEALFIELD_*` variables. `vars` replaces the process environment when set.
fn environment(vars: Option<config::Map<String, String>>) -> config::Environment {
    config::Environment::with_prefix("SEALFIELD")
        .prefix_separator("_")
        .separator("__")
        .source(vars)
}
