//! [`JsonFileKeysetStore`]: keyset store persisted as a single JSON document.
//!
//! Every mutation reads the document, applies the change, and atomically
//! replaces the file through a temporary file in the same directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use common::KeysetError;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{KeyRecord, KeysetRecord, KeysetStore, StoreState};

/// File-backed store. A process-local mutex serialises read-modify-write cycles.
#[derive(Debug)]
pub struct JsonFileKeysetStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileKeysetStore {
    /// Open (or lazily create) the store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreState, KeysetError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, state: &StoreState) -> Result<(), KeysetError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        let json = serde_json::to_vec_pretty(state)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| KeysetError::Io(e.error.to_string()))?;
        debug!(path = %self.path.display(), "keyset store written");
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> Result<T, KeysetError>) -> Result<T, KeysetError> {
        f(&self.load()?)
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, KeysetError>,
    ) -> Result<T, KeysetError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| KeysetError::Io(format!("keyset store lock poisoned: {e}")))?;
        let mut state = self.load()?;
        let out = f(&mut state)?;
        self.persist(&state)?;
        Ok(out)
    }
}

impl KeysetStore for JsonFileKeysetStore {
    fn get_keyset(&self, name: &str) -> Result<KeysetRecord, KeysetError> {
        self.read(|s| s.get_keyset(name))
    }

    fn list_keysets(&self) -> Result<Vec<KeysetRecord>, KeysetError> {
        self.read(|s| Ok(s.list_keysets()))
    }

    fn insert_keyset(&self, name: &str) -> Result<KeysetRecord, KeysetError> {
        self.update(|s| s.insert_keyset(name))
    }

    fn set_primary(&self, name: &str, key_id: u32) -> Result<(), KeysetError> {
        self.update(|s| s.set_primary(name, key_id))
    }

    fn delete_keyset(&self, name: &str) -> Result<(), KeysetError> {
        self.update(|s| s.delete_keyset(name))
    }

    fn next_key_id(&self) -> Result<u32, KeysetError> {
        self.update(|s| Ok(s.next_key_id()))
    }

    fn insert_key(&self, key: KeyRecord) -> Result<(), KeysetError> {
        self.update(|s| s.insert_key(key))
    }

    fn keys(&self, keyset: &str) -> Result<Vec<KeyRecord>, KeysetError> {
        self.read(|s| Ok(s.keys(keyset)))
    }
}
