//! A generic key-value table abstraction.
//!
//! Generalized from the teacher's trait-based page storage abstraction
//! (`PageStore` in `sombra-pager`) from page-level bytes to typed
//! tables, since this crate's Core/Ephemeral split is a logical
//! boundary rather than a physical one (spec §6: "no requirement on the
//! physical store beyond transactional writes within a single table").
//! [`InMemoryTable`] is the only implementation this crate ships.

use std::hash::Hash;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// A table keyed by `K` storing values of type `V`.
///
/// Every method takes `&self`: callers rely on interior mutability so a
/// single `Table` can be shared behind an `Arc` without a surrounding
/// lock, matching how the rest of the engine holds its stores.
pub trait Table<K, V>: Send + Sync
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn get(&self, key: &K) -> Option<V>;
    fn insert(&self, key: K, value: V) -> Option<V>;
    fn remove(&self, key: &K) -> Option<V>;
    fn contains(&self, key: &K) -> bool;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// All values currently in the table, in unspecified order.
    fn values(&self) -> Vec<V>;
}

/// A non-durable, in-process table backed by a hash map behind a
/// read-write lock.
#[derive(Debug)]
pub struct InMemoryTable<K, V> {
    entries: RwLock<FxHashMap<K, V>>,
}

impl<K, V> InMemoryTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }
}

impl<K, V> Default for InMemoryTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Table<K, V> for InMemoryTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.write().insert(key, value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key)
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn values(&self) -> Vec<V> {
        self.entries.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_round_trip() {
        let table: InMemoryTable<String, u32> = InMemoryTable::new();
        assert_eq!(table.insert("a".into(), 1), None);
        assert_eq!(table.get(&"a".to_string()), Some(1));
        assert_eq!(table.insert("a".into(), 2), Some(1));
        assert_eq!(table.remove(&"a".to_string()), Some(2));
        assert!(table.is_empty());
    }
}
