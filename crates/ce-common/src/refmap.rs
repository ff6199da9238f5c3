//! Reference-counted concurrent resource map.
//!
//! Global resources (LTPs, UNIs) are shared by any number of installed
//! services. `RefMap` pairs each entry with an atomic reference count and
//! refuses removal while the count is non-zero, so a topology callback
//! cannot delete an interface out from under an installed service.
//!
//! The map is safe under concurrent mutation (insert/remove/iterate), but
//! multi-step read-then-write sequences across separate calls are not
//! atomic; callers increment before attempting dependent work and
//! decrement symmetrically on every exit path.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use thiserror::Error;

/// Error type for `RefMap` operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefMapError {
    /// The key is not present in the map.
    #[error("Key not found")]
    KeyNotFound,

    /// The entry is still referenced and cannot be removed.
    #[error("Entry still referenced ({0} references)")]
    StillReferenced(u32),

    /// Decrementing would drop the reference count below zero.
    #[error("Reference count underflow")]
    RefCountUnderflow,
}

struct RefEntry<V> {
    value: V,
    refs: AtomicU32,
}

/// A concurrent map of reference-counted resources keyed by stable string ids.
///
/// Entries are created with a zero reference count. `try_remove` only
/// succeeds when the count is back at zero.
pub struct RefMap<V> {
    inner: DashMap<String, RefEntry<V>>,
}

impl<V> Default for RefMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RefMap<V> {
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns true if the key is present.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    /// Inserts a new entry with a zero reference count.
    ///
    /// Returns false (leaving the existing entry untouched) if the key is
    /// already present.
    pub fn insert(&self, id: impl Into<String>, value: V) -> bool {
        let id = id.into();
        match self.inner.entry(id) {
            dashmap::Entry::Occupied(_) => false,
            dashmap::Entry::Vacant(e) => {
                e.insert(RefEntry {
                    value,
                    refs: AtomicU32::new(0),
                });
                true
            }
        }
    }

    /// Applies `f` to the value for `id`, if present.
    pub fn with_value<R>(&self, id: &str, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.inner.get(id).map(|e| f(&e.value))
    }

    /// Applies `f` to a mutable reference to the value for `id`, if present.
    pub fn with_value_mut<R>(&self, id: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.inner.get_mut(id).map(|mut e| f(&mut e.value))
    }

    /// Returns the reference count for `id`, if present.
    pub fn ref_count(&self, id: &str) -> Option<u32> {
        self.inner.get(id).map(|e| e.refs.load(Ordering::SeqCst))
    }

    /// Increments the reference count for `id` and returns the new value.
    pub fn increment_ref(&self, id: &str) -> Result<u32, RefMapError> {
        let entry = self.inner.get(id).ok_or(RefMapError::KeyNotFound)?;
        Ok(entry.refs.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Decrements the reference count for `id` and returns the new value.
    ///
    /// Fails without modifying the count if it is already zero.
    pub fn decrement_ref(&self, id: &str) -> Result<u32, RefMapError> {
        let entry = self.inner.get(id).ok_or(RefMapError::KeyNotFound)?;
        let mut current = entry.refs.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return Err(RefMapError::RefCountUnderflow);
            }
            match entry.refs.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(current - 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// Removes and returns the entry for `id` if its reference count is zero.
    pub fn try_remove(&self, id: &str) -> Result<V, RefMapError> {
        match self
            .inner
            .remove_if(id, |_, e| e.refs.load(Ordering::SeqCst) == 0)
        {
            Some((_, e)) => Ok(e.value),
            None => {
                let refs = self.ref_count(id).ok_or(RefMapError::KeyNotFound)?;
                Err(RefMapError::StillReferenced(refs))
            }
        }
    }

    /// Returns the ids of all entries, sorted for deterministic iteration.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl<V: Clone> RefMap<V> {
    /// Returns a snapshot clone of the value for `id`, if present.
    pub fn get_cloned(&self, id: &str) -> Option<V> {
        self.inner.get(id).map(|e| e.value.clone())
    }

    /// Returns snapshot clones of all values, ordered by id.
    pub fn values(&self) -> Vec<V> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.get_cloned(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let map: RefMap<i32> = RefMap::new();
        assert!(map.insert("a", 1));
        assert!(!map.insert("a", 2));
        assert!(map.contains("a"));
        assert_eq!(map.get_cloned("a"), Some(1));
    }

    #[test]
    fn test_ref_count_lifecycle() {
        let map: RefMap<i32> = RefMap::new();
        map.insert("a", 1);
        assert_eq!(map.ref_count("a"), Some(0));
        assert_eq!(map.increment_ref("a"), Ok(1));
        assert_eq!(map.increment_ref("a"), Ok(2));
        assert_eq!(map.decrement_ref("a"), Ok(1));
        assert_eq!(map.decrement_ref("a"), Ok(0));
        assert_eq!(map.decrement_ref("a"), Err(RefMapError::RefCountUnderflow));
    }

    #[test]
    fn test_try_remove_guarded_by_refs() {
        let map: RefMap<i32> = RefMap::new();
        map.insert("a", 1);
        map.increment_ref("a").unwrap();
        assert_eq!(map.try_remove("a"), Err(RefMapError::StillReferenced(1)));
        assert!(map.contains("a"));
        map.decrement_ref("a").unwrap();
        assert_eq!(map.try_remove("a"), Ok(1));
        assert!(!map.contains("a"));
    }

    #[test]
    fn test_try_remove_missing() {
        let map: RefMap<i32> = RefMap::new();
        assert_eq!(map.try_remove("missing"), Err(RefMapError::KeyNotFound));
    }

    #[test]
    fn test_ids_sorted() {
        let map: RefMap<i32> = RefMap::new();
        map.insert("b", 2);
        map.insert("a", 1);
        map.insert("c", 3);
        assert_eq!(map.ids(), vec!["a", "b", "c"]);
        assert_eq!(map.values(), vec![1, 2, 3]);
    }
}
