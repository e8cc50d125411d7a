//! Keyed load-once cache.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use parking_lot::RwLock;

use crate::Result;

type Loader<K, V> = Box<dyn Fn(&K) -> Result<V> + Send + Sync>;

/// Thread-safe memoizing cache. The loader runs at most once per key, under
/// the write lock; failed loads are not cached.
pub struct LazyCache<K, V> {
    entries: RwLock<HashMap<K, Arc<V>>>,
    load: Loader<K, V>,
}

impl<K, V> LazyCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new<F>(load: F) -> Self
    where
        F: Fn(&K) -> Result<V> + Send + Sync + 'static,
    {
        Self {
            entries: RwLock::new(HashMap::new()),
            load: Box::new(load),
        }
    }

    /// Cached value for `key`, loading it on first access. The flag is
    /// `true` when the value was already present.
    pub fn load(&self, key: &K) -> Result<(Arc<V>, bool)> {
        if let Some(value) = self.entries.read().get(key) {
            return Ok((Arc::clone(value), true));
        }
        let mut write = self.entries.write();
        if let Some(value) = write.get(key) {
            return Ok((Arc::clone(value), true));
        }
        let loaded = Arc::new((self.load)(key)?);
        write.insert(key.clone(), Arc::clone(&loaded));
        Ok((loaded, false))
    }

    pub fn load_existing(&self, key: &K) -> Option<Arc<V>> {
        self.entries.read().get(key).map(Arc::clone)
    }

    /// Snapshot of all cached entries.
    pub fn entries(&self) -> Vec<(K, Arc<V>)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K, V> std::fmt::Debug for LazyCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyCache")
            .field("len", &self.entries.read().len())
            .finish()
    }
}
