//! Enumerable set with a reverse index.
//!
//! Elements live in a dense vector; a map records each element's slot so that
//! insert, remove, and membership checks stay O(1) while enumeration remains a
//! plain slice walk. Removal swaps the last element into the vacated slot and
//! patches its index entry.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct IndexedSet<T> {
    items: Vec<T>,
    index: HashMap<T, usize>,
}

impl<T> Default for IndexedSet<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Clone + Eq + Hash> IndexedSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an element. Returns `false` if it was already present.
    pub fn insert(&mut self, item: T) -> bool {
        if self.index.contains_key(&item) {
            return false;
        }
        self.index.insert(item.clone(), self.items.len());
        self.items.push(item);
        true
    }

    /// Remove an element. Returns `false` if it was absent.
    pub fn remove(&mut self, item: &T) -> bool {
        let Some(slot) = self.index.remove(item) else {
            return false;
        };
        let last = self.items.len() - 1;
        if slot != last {
            self.items.swap(slot, last);
            self.index.insert(self.items[slot].clone(), slot);
        }
        self.items.pop();
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.index.contains_key(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

impl<T: Clone + Eq + Hash> FromIterator<T> for IndexedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            set.insert(item);
        }
        set
    }
}
