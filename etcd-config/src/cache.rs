//! Thread-safe in-memory cache for the relative keys of one namespace.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Many readers, one writer. The sync task is the only caller of the
/// mutating methods once construction finishes.
pub struct Cache {
    inner: RwLock<HashMap<String, String>>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Point-in-time copy of every entry, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Applies a single change. A delete of an absent key is a no-op.
    pub(crate) fn apply(&self, key: String, value: String, is_delete: bool) {
        let mut guard = self.write();
        if is_delete {
            guard.remove(&key);
        } else {
            guard.insert(key, value);
        }
    }

    /// Replaces the whole contents with a freshly loaded snapshot under one
    /// write lock. Empty values mean "not set" and are dropped.
    pub(crate) fn load<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let fresh: HashMap<String, String> = entries
            .into_iter()
            .filter(|(_, v)| !v.is_empty())
            .collect();
        *self.write() = fresh;
    }

    // A panicking reader cannot leave the map half-written, so poisoning is
    // ignored rather than propagated.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
