//! Latest-state cache with named secondary indices.

use std::sync::{Arc, RwLock};

use mirador_core::{Identity, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::KnownKeys;

/// Maps an object to the index values it should be findable under.
pub type IndexFn<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;

/// Thread-safe key→latest-snapshot map. Each mutation maintains the primary
/// entry and every secondary index inside one write section, so readers never
/// observe a torn state; reads proceed concurrently with other reads.
pub struct IndexedStore<T: Identity> {
    inner: RwLock<StoreInner<T>>,
}

struct StoreInner<T> {
    objects: FxHashMap<ObjectKey, T>,
    index_fns: FxHashMap<String, IndexFn<T>>,
    // index name -> index value -> keys
    indices: FxHashMap<String, FxHashMap<String, FxHashSet<ObjectKey>>>,
}

impl<T: Identity> Default for IndexedStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Identity> IndexedStore<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                objects: FxHashMap::default(),
                index_fns: FxHashMap::default(),
                indices: FxHashMap::default(),
            }),
        }
    }

    /// Register a named secondary index. Existing entries are re-indexed, so
    /// this is safe (if unusual) after population.
    pub fn add_index(&self, name: impl Into<String>, f: IndexFn<T>) {
        let name = name.into();
        let mut inner = self.inner.write().unwrap();
        let mut bucket: FxHashMap<String, FxHashSet<ObjectKey>> = FxHashMap::default();
        for (key, obj) in &inner.objects {
            for value in f(obj) {
                bucket.entry(value).or_default().insert(key.clone());
            }
        }
        inner.indices.insert(name.clone(), bucket);
        inner.index_fns.insert(name, f);
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.inner.read().unwrap().objects.get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.inner.read().unwrap().objects.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.inner.read().unwrap().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects whose `name` index contains `value`.
    pub fn list_by_index(&self, name: &str, value: &str) -> Vec<T> {
        let inner = self.inner.read().unwrap();
        let Some(bucket) = inner.indices.get(name) else { return Vec::new() };
        let Some(keys) = bucket.get(value) else { return Vec::new() };
        keys.iter().filter_map(|k| inner.objects.get(k).cloned()).collect()
    }

    /// Distinct values present in the `name` index.
    pub fn index_keys(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .indices
            .get(name)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Insert or overwrite the snapshot for `key`, returning the displaced
    /// one.
    pub fn upsert(&self, key: &str, object: T) -> Option<T> {
        let mut inner = self.inner.write().unwrap();
        let old = inner.objects.insert(key.to_string(), object.clone());
        if let Some(old) = &old {
            Self::unindex_locked(&mut inner, key, old);
        }
        Self::index_locked(&mut inner, key, &object);
        old
    }

    /// Remove the snapshot for `key`, returning it.
    pub fn delete(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.write().unwrap();
        let old = inner.objects.remove(key);
        if let Some(old) = &old {
            Self::unindex_locked(&mut inner, key, old);
        }
        old
    }

    fn index_locked(inner: &mut StoreInner<T>, key: &str, object: &T) {
        let fns: Vec<(String, IndexFn<T>)> = inner
            .index_fns
            .iter()
            .map(|(n, f)| (n.clone(), Arc::clone(f)))
            .collect();
        for (name, f) in fns {
            let bucket = inner.indices.entry(name).or_default();
            for value in f(object) {
                bucket.entry(value).or_default().insert(key.to_string());
            }
        }
    }

    fn unindex_locked(inner: &mut StoreInner<T>, key: &str, object: &T) {
        let fns: Vec<(String, IndexFn<T>)> = inner
            .index_fns
            .iter()
            .map(|(n, f)| (n.clone(), Arc::clone(f)))
            .collect();
        for (name, f) in fns {
            if let Some(bucket) = inner.indices.get_mut(&name) {
                for value in f(object) {
                    if let Some(keys) = bucket.get_mut(&value) {
                        keys.remove(key);
                        if keys.is_empty() {
                            bucket.remove(&value);
                        }
                    }
                }
            }
        }
    }
}

impl<T: Identity> KnownKeys<T> for IndexedStore<T> {
    fn known_keys(&self) -> Vec<ObjectKey> {
        self.keys()
    }

    fn last_snapshot(&self, key: &str) -> Option<T> {
        self.get(key)
    }
}
