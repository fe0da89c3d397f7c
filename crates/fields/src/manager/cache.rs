//! In-memory cache of loaded keyset primitives, keyed by keyset name.
//!
//! Reads are lock-free through `arc-swap`; the map is only written when a
//! keyset is loaded for the first time or invalidated.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;

use crate::keyset::{KeysetAead, KeysetDeterministicAead};

/// A loaded keyset, wrapped as the primitive its keys support.
#[derive(Clone)]
pub enum CachedKeyset {
    Aead(Arc<KeysetAead>),
    Deterministic(Arc<KeysetDeterministicAead>),
}

impl std::fmt::Debug for CachedKeyset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CachedKeyset::Aead(_) => f.write_str("CachedKeyset::Aead"),
            CachedKeyset::Deterministic(_) => f.write_str("CachedKeyset::Deterministic"),
        }
    }
}

/// Shared cache of keyset primitives.
#[derive(Clone, Debug)]
pub struct HandleCache {
    inner: Arc<ArcSwap<HashMap<String, CachedKeyset>>>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(Arc::new(HashMap::new()))),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    /// Look up a keyset by name.
    pub fn get(&self, name: &str) -> Option<CachedKeyset> {
        self.inner.load().get(name).cloned()
    }

    /// Names of every cached keyset, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Insert `entry` unless another thread cached `name` first.
    ///
    /// Returns whichever entry ended up in the cache, so concurrent loaders
    /// all hand out the same primitive.
    pub fn insert(&self, name: &str, entry: CachedKeyset) -> CachedKeyset {
        let mut stored = entry.clone();
        self.inner.rcu(|current| {
            if let Some(existing) = current.get(name) {
                stored = existing.clone();
                return Arc::clone(current);
            }
            stored = entry.clone();
            let mut next = HashMap::clone(current);
            next.insert(name.to_owned(), entry.clone());
            Arc::new(next)
        });
        stored
    }

    /// Drop `name` from the cache. Returns `true` if it was present.
    pub fn remove(&self, name: &str) -> bool {
        let mut removed = false;
        self.inner.rcu(|current| {
            removed = current.contains_key(name);
            if !removed {
                return Arc::clone(current);
            }
            let mut next = HashMap::clone(current);
            next.remove(name);
            Arc::new(next)
        });
        removed
    }
}

impl Default for HandleCache {
    fn default() -> Self {
        Self::new()
    }
}
