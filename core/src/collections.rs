//! Hashed collections: sets and maps that iterate in hash order rather than insertion order,
//! so two peers that built the same logical collection by different insertion sequences
//! literalize identically.
use crate::hash::{hash_value, Hash, Value};
use std::collections::BTreeMap;

/// A value that can be reduced to the canonical `Value` domain for hashing.
pub trait Hashable {
    /// Produces this value's canonical representation.
    fn to_value(&self) -> Value;

    /// Hashes `self` via its canonical representation.
    fn hash(&self) -> crate::error::Result<Hash> {
        hash_value(&self.to_value())
    }
}

impl Hashable for Hash {
    fn to_value(&self) -> Value {
        Value::from(*self)
    }
}

impl Hashable for String {
    fn to_value(&self) -> Value {
        Value::from(self.clone())
    }
}

/// A set of hashable elements, always iterated in ascending hash order.
///
/// Backed by a `BTreeMap` keyed on each element's own hash: insertion order is never
/// observable, which is exactly the property the canonical literalization of collections
/// depends on.
#[derive(Clone, Debug, Default)]
pub struct HashedSet<T> {
    by_hash: BTreeMap<Hash, T>,
}

impl<T: Hashable> HashedSet<T> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            by_hash: BTreeMap::new(),
        }
    }

    /// Inserts `item`, replacing any existing element with the same hash.
    ///
    /// Returns the previous element, if one had the same hash.
    pub fn insert(&mut self, item: T) -> crate::error::Result<Option<T>> {
        let h = item.hash()?;
        Ok(self.by_hash.insert(h, item))
    }

    /// Removes the element with the given hash, if present.
    pub fn remove(&mut self, hash: &Hash) -> Option<T> {
        self.by_hash.remove(hash)
    }

    /// Returns whether an element with this hash is present.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Looks up the element with this hash.
    pub fn get(&self, hash: &Hash) -> Option<&T> {
        self.by_hash.get(hash)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether the set holds no elements.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Iterates elements in ascending hash order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.by_hash.values()
    }

    /// Iterates (hash, element) pairs in ascending hash order.
    pub fn iter_with_hashes(&self) -> impl Iterator<Item = (&Hash, &T)> {
        self.by_hash.iter()
    }

    /// Canonical value: an array of the elements' own values, ordered by their hash.
    pub fn to_value(&self) -> Value {
        Value::Array(self.by_hash.values().map(Hashable::to_value).collect())
    }
}

impl<T: Hashable> FromIterator<T> for HashedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for item in iter {
            // Malformed (non-finite-number) elements are dropped rather than panicking;
            // callers that need strict construction should use `insert` directly.
            let _ = set.insert(item);
        }
        set
    }
}

/// A map from hashable keys to arbitrary values, iterated in ascending key-hash order.
#[derive(Clone, Debug, Default)]
pub struct HashedMap<K, V> {
    by_hash: BTreeMap<Hash, (K, V)>,
}

impl<K: Hashable, V> HashedMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            by_hash: BTreeMap::new(),
        }
    }

    /// Inserts a key/value pair, replacing any existing value for a key with the same hash.
    pub fn insert(&mut self, key: K, value: V) -> crate::error::Result<Option<V>> {
        let h = key.hash()?;
        Ok(self.by_hash.insert(h, (key, value)).map(|(_, v)| v))
    }

    /// Removes the entry whose key hashes to `hash`.
    pub fn remove(&mut self, hash: &Hash) -> Option<(K, V)> {
        self.by_hash.remove(hash)
    }

    /// Looks up the value for the key with this hash.
    pub fn get(&self, hash: &Hash) -> Option<&V> {
        self.by_hash.get(hash).map(|(_, v)| v)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Iterates (key, value) pairs in ascending key-hash order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.by_hash.values().map(|(k, v)| (k, v))
    }
}

impl<K: Hashable, V: Hashable> HashedMap<K, V> {
    /// Canonical value: an array of `[key, value]` pairs, ordered by key hash.
    pub fn to_value(&self) -> Value {
        Value::Array(
            self.by_hash
                .values()
                .map(|(k, v)| Value::Array(vec![k.to_value(), v.to_value()]))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Item(&'static str);

    impl Hashable for Item {
        fn to_value(&self) -> Value {
            Value::from(self.0)
        }
    }

    #[test]
    fn iteration_order_is_independent_of_insertion_order() {
        let mut a = HashedSet::new();
        a.insert(Item("zebra")).unwrap();
        a.insert(Item("apple")).unwrap();
        a.insert(Item("mango")).unwrap();

        let mut b = HashedSet::new();
        b.insert(Item("mango")).unwrap();
        b.insert(Item("apple")).unwrap();
        b.insert(Item("zebra")).unwrap();

        let order_a: Vec<&str> = a.iter().map(|i| i.0).collect();
        let order_b: Vec<&str> = b.iter().map(|i| i.0).collect();
        assert_eq!(order_a, order_b);
        assert_eq!(a.to_value(), b.to_value());
    }

    #[test]
    fn duplicate_insert_replaces_rather_than_duplicates() {
        let mut s = HashedSet::new();
        s.insert(Item("apple")).unwrap();
        s.insert(Item("apple")).unwrap();
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn map_iterates_by_key_hash_not_insertion() {
        let mut m: HashedMap<Item, i64> = HashedMap::new();
        m.insert(Item("zebra"), 1).unwrap();
        m.insert(Item("apple"), 2).unwrap();
        let keys: Vec<&str> = m.iter().map(|(k, _)| k.0).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
