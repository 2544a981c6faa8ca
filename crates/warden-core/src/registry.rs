//! Id-to-object table for objects that cross the process boundary.
//!
//! A registry hands out one [`HandleId`] per live object. Objects are compared
//! by identity (the `Arc` allocation), so two equal values that are different
//! objects get different ids. Ids are never reused within one registry.

use crate::value::HandleId;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Lookup of an id the registry never minted (or has forgotten).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no object registered under handle {0}")]
pub struct NotFound(pub HandleId);

/// Identity-keyed map between live objects and numeric ids.
#[derive(Debug)]
pub struct HandleRegistry<T> {
    objects: HashMap<HandleId, Arc<T>>,
    ids: HashMap<usize, HandleId>,
    next_id: u64,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            ids: HashMap::new(),
            next_id: 1,
        }
    }

    // The registry keeps a strong reference to every object it has an id
    // for, so an address cannot be reused while its entry exists.
    fn identity(object: &Arc<T>) -> usize {
        Arc::as_ptr(object) as *const () as usize
    }

    /// Id for `object`, minting a new one on first sight.
    pub fn get_or_create(&mut self, object: &Arc<T>) -> HandleId {
        let key = Self::identity(object);
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        let id = HandleId(self.next_id);
        self.next_id += 1;
        self.ids.insert(key, id);
        self.objects.insert(id, Arc::clone(object));
        id
    }

    /// Object registered under `id`.
    pub fn lookup(&self, id: HandleId) -> Result<Arc<T>, NotFound> {
        self.objects.get(&id).cloned().ok_or(NotFound(id))
    }

    /// Object registered under a foreign `id`, building and recording it on
    /// first sight.
    ///
    /// Used on the caller side, where ids are minted by the worker and only
    /// mirrored here.
    pub fn get_or_adopt(&mut self, id: HandleId, make: impl FnOnce(HandleId) -> T) -> Arc<T> {
        if let Some(existing) = self.objects.get(&id) {
            return Arc::clone(existing);
        }
        let object = Arc::new(make(id));
        self.ids.insert(Self::identity(&object), id);
        self.objects.insert(id, Arc::clone(&object));
        if id.0 >= self.next_id {
            self.next_id = id.0 + 1;
        }
        object
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_object_gets_same_id() {
        let mut registry = HandleRegistry::new();
        let object = Arc::new("module".to_string());

        let first = registry.get_or_create(&object);
        let second = registry.get_or_create(&Arc::clone(&object));
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_equal_values_are_distinct_objects() {
        let mut registry = HandleRegistry::new();
        let a = Arc::new(5);
        let b = Arc::new(5);

        let id_a = registry.get_or_create(&a);
        let id_b = registry.get_or_create(&b);
        assert_ne!(id_a, id_b);
        assert!(id_b > id_a);
    }

    #[test]
    fn test_lookup_returns_registered_object() {
        let mut registry = HandleRegistry::new();
        let object = Arc::new(vec![1, 2, 3]);
        let id = registry.get_or_create(&object);

        let found = registry.lookup(id).unwrap();
        assert!(Arc::ptr_eq(&found, &object));
    }

    #[test]
    fn test_lookup_unknown_id_is_not_found() {
        let registry: HandleRegistry<u8> = HandleRegistry::new();
        assert_eq!(registry.lookup(HandleId(42)), Err(NotFound(HandleId(42))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registered_object_outlives_caller_reference() {
        let mut registry = HandleRegistry::new();
        let id = registry.get_or_create(&Arc::new("temporary".to_string()));

        assert_eq!(registry.lookup(id).unwrap().as_str(), "temporary");
    }

    #[test]
    fn test_get_or_adopt_builds_once() {
        let mut registry = HandleRegistry::new();
        let mut built = 0;

        let first = registry.get_or_adopt(HandleId(7), |id| {
            built += 1;
            id.0 * 10
        });
        let second = registry.get_or_adopt(HandleId(7), |_| unreachable!());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, 70);
        assert_eq!(built, 1);
        assert!(registry.contains(HandleId(7)));
    }
}
