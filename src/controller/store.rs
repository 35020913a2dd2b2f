//! Concurrency-safe indexed object store
//!
//! Each listener owns one store per kind and is the only writer. Readers get
//! `Arc` snapshots of individual objects, so a reconcile never holds the lock
//! across an await point.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use super::keys::ObjectKey;

struct Entries<K> {
    objects: HashMap<ObjectKey, (Arc<K>, Option<ObjectKey>)>,
    by_owner: HashMap<ObjectKey, BTreeSet<ObjectKey>>,
}

impl<K> Entries<K> {
    fn unindex(&mut self, key: &ObjectKey, owner: Option<&ObjectKey>) {
        if let Some(owner) = owner {
            if let Some(children) = self.by_owner.get_mut(owner) {
                children.remove(key);
                if children.is_empty() {
                    self.by_owner.remove(owner);
                }
            }
        }
    }
}

pub struct IndexedStore<K> {
    entries: RwLock<Entries<K>>,
}

impl<K> Default for IndexedStore<K> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Entries {
                objects: HashMap::new(),
                by_owner: HashMap::new(),
            }),
        }
    }
}

impl<K> IndexedStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.objects.get(key).map(|(obj, _)| obj.clone())
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.objects.values().map(|(obj, _)| obj.clone()).collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects indexed under `owner`, ordered by key
    pub fn list_by_owner(&self, owner: &ObjectKey) -> Vec<(ObjectKey, Arc<K>)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|key| {
                entries
                    .objects
                    .get(key)
                    .map(|(obj, _)| (key.clone(), obj.clone()))
            })
            .collect()
    }

    /// Insert or replace an object, moving it to `owner`'s index
    pub fn upsert(&self, key: ObjectKey, obj: K, owner: Option<ObjectKey>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, previous)) = entries.objects.remove(&key) {
            entries.unindex(&key, previous.as_ref());
        }
        if let Some(owner) = &owner {
            entries
                .by_owner
                .entry(owner.clone())
                .or_default()
                .insert(key.clone());
        }
        entries.objects.insert(key, (Arc::new(obj), owner));
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let (obj, owner) = entries.objects.remove(key)?;
        entries.unindex(key, owner.as_ref());
        Some(obj)
    }

    /// Swap the whole content, as after a relist. Returns the objects that
    /// were present before and are missing from `items`.
    pub fn replace(&self, items: Vec<(ObjectKey, K, Option<ObjectKey>)>) -> Vec<Arc<K>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut objects = HashMap::with_capacity(items.len());
        let mut by_owner: HashMap<ObjectKey, BTreeSet<ObjectKey>> = HashMap::new();

        for (key, obj, owner) in items {
            if let Some(owner) = &owner {
                by_owner.entry(owner.clone()).or_default().insert(key.clone());
            }
            objects.insert(key, (Arc::new(obj), owner));
        }

        let removed = entries
            .objects
            .iter()
            .filter(|(key, _)| !objects.contains_key(*key))
            .map(|(_, (obj, _))| obj.clone())
            .collect();

        entries.objects = objects;
        entries.by_owner = by_owner;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[test]
    fn test_upsert_and_get() {
        let store = IndexedStore::new();
        store.upsert(key("a"), 1, None);
        store.upsert(key("a"), 2, None);

        assert_eq!(store.get(&key("a")).as_deref(), Some(&2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_owner_index_follows_updates() {
        let store = IndexedStore::new();
        store.upsert(key("front"), "deploy", Some(key("app")));
        store.upsert(key("back"), "deploy", Some(key("app")));
        assert_eq!(store.list_by_owner(&key("app")).len(), 2);

        // owner reference moved to another stack
        store.upsert(key("front"), "deploy", Some(key("app2")));
        let app: Vec<ObjectKey> = store
            .list_by_owner(&key("app"))
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(app, vec![key("back")]);
        assert_eq!(store.list_by_owner(&key("app2")).len(), 1);
    }

    #[test]
    fn test_delete_unindexes() {
        let store = IndexedStore::new();
        store.upsert(key("front"), 1, Some(key("app")));

        assert!(store.delete(&key("front")).is_some());
        assert!(store.delete(&key("front")).is_none());
        assert!(store.list_by_owner(&key("app")).is_empty());
    }

    #[test]
    fn test_replace_reports_vanished_objects() {
        let store = IndexedStore::new();
        store.upsert(key("a"), 1, None);
        store.upsert(key("b"), 2, Some(key("app")));

        let removed = store.replace(vec![(key("a"), 10, None), (key("c"), 3, Some(key("app")))]);

        assert_eq!(removed.iter().map(|v| **v).collect::<Vec<_>>(), vec![2]);
        assert_eq!(store.get(&key("a")).as_deref(), Some(&10));
        let owned: Vec<ObjectKey> = store
            .list_by_owner(&key("app"))
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(owned, vec![key("c")]);
    }
}
