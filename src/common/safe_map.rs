//! Read/write locked map shared by the relay registries

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

/// Concurrent map with short, non-blocking critical sections.
///
/// Reads hand out clones so no guard ever escapes a method call, which keeps
/// the lock from being held across an `.await`.
pub struct SafeMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> SafeMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.write().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.read().values().cloned().collect()
    }

    /// Copy of the whole map
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.inner.read().clone()
    }

    /// First value matching the predicate
    pub fn find<F>(&self, mut predicate: F) -> Option<V>
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.inner
            .read()
            .iter()
            .find(|(k, v)| predicate(k, v))
            .map(|(_, v)| v.clone())
    }

    /// Mutate one entry in place, returning `None` when the key is absent
    pub fn update<R, F>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        self.inner.write().get_mut(key).map(f)
    }

    pub fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.inner.write().retain(f);
    }

    /// Run a read-modify-write sequence atomically
    pub fn with_mut<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<K, V>) -> R,
    {
        f(&mut self.inner.write())
    }
}

impl<K, V> Default for SafeMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
