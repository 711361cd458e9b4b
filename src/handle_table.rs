//! HandleTable: generational slots with a hashed key index.
//!
//! Native ids handed across the provider boundary are slot keys encoded as
//! `u64`. Generations make a destroyed id stale forever instead of letting it
//! alias whatever object later reuses the slot.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use hashbrown::HashTable;
use slotmap::{DefaultKey, Key, KeyData, SlotMap};
use std::collections::hash_map::RandomState;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Slot(DefaultKey);

impl Slot {
    pub(crate) fn new(k: DefaultKey) -> Self {
        Slot(k)
    }

    pub(crate) fn raw_key(&self) -> DefaultKey {
        self.0
    }

    /// Encode as an opaque, never-zero id.
    pub fn to_id(self) -> u64 {
        self.0.data().as_ffi()
    }

    /// Decode an id produced by `to_id`. Zero is the null id and never
    /// decodes.
    pub fn from_id(id: u64) -> Option<Self> {
        if id == 0 {
            return None;
        }
        Some(Slot(DefaultKey::from(KeyData::from_ffi(id))))
    }
}

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    hash: u64,
}

pub struct HandleTable<K, V, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Entry<K, V>>,
}

#[cfg(test)]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InsertError {
    DuplicateKey,
}

impl<K, V> HandleTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, V> Default for HandleTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> HandleTable<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            hasher,
            index: HashTable::new(),
            slots: SlotMap::with_key(),
        }
    }

    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn find<Q>(&self, q: &Q) -> Option<Slot>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        self.index
            .find(hash, |&k| {
                self.slots
                    .get(k)
                    .map(|e| e.key.borrow() == q)
                    .unwrap_or(false)
            })
            .map(|&k| Slot::new(k))
    }

    #[cfg(test)]
    pub(crate) fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find(q).is_some()
    }

    /// Return the slot for `key`, inserting `default()` if it is absent.
    /// The flag is true when an entry was inserted; `default` only runs then.
    pub fn find_or_insert_with<F>(&mut self, key: K, default: F) -> (Slot, bool)
    where
        F: FnOnce() -> V,
    {
        let hash = self.make_hash(&key);
        match self.index.entry(
            hash,
            |&kk| self.slots.get(kk).map(|e| e.key == key).unwrap_or(false),
            |&kk| self.slots.get(kk).map(|e| e.hash).unwrap_or(0),
        ) {
            hashbrown::hash_table::Entry::Occupied(o) => (Slot::new(*o.get()), false),
            hashbrown::hash_table::Entry::Vacant(v) => {
                let value = default();
                let k = self.slots.insert(Entry { key, value, hash });
                let _ = v.insert(k);
                (Slot::new(k), true)
            }
        }
    }

    /// Insert using a lazy value constructor; `default` only runs when the
    /// key is absent.
    #[cfg(test)]
    pub(crate) fn insert_with<F>(&mut self, key: K, default: F) -> Result<Slot, InsertError>
    where
        F: FnOnce() -> V,
    {
        match self.find_or_insert_with(key, default) {
            (slot, true) => Ok(slot),
            (_, false) => Err(InsertError::DuplicateKey),
        }
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, key: K, value: V) -> Result<Slot, InsertError> {
        self.insert_with(key, || value)
    }

    pub fn remove(&mut self, slot: Slot) -> Option<(K, V)> {
        let k = slot.raw_key();
        let entry = self.slots.remove(k)?;
        if let Ok(occupied) = self.index.find_entry(entry.hash, |&kk| kk == k) {
            let _ = occupied.remove();
        }
        Some((entry.key, entry.value))
    }

    pub fn key(&self, slot: Slot) -> Option<&K> {
        self.slots.get(slot.raw_key()).map(|e| &e.key)
    }

    pub fn get(&self, slot: Slot) -> Option<&V> {
        self.slots.get(slot.raw_key()).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut V> {
        self.slots.get_mut(slot.raw_key()).map(|e| &mut e.value)
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Slot, &K, &V)> {
        self.slots
            .iter()
            .map(|(k, e)| (Slot::new(k), &e.key, &e.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Invariant: Duplicate keys are rejected and the table remains unchanged.
    #[test]
    fn duplicate_insert_rejected() {
        let mut m: HandleTable<String, i32> = HandleTable::new();
        let slot = m.insert("dup".to_string(), 1).unwrap();
        assert_eq!(m.insert("dup".to_string(), 2), Err(InsertError::DuplicateKey));
        assert_eq!(m.get(slot), Some(&1));
        assert_eq!(m.len(), 1);
    }

    /// Invariant: Borrowed lookup works (store `String`, query with `&str`).
    #[test]
    fn borrowed_lookup_with_str() {
        let mut m: HandleTable<String, i32> = HandleTable::new();
        m.insert("hello".to_string(), 1).unwrap();
        assert!(m.contains_key("hello"));
        assert!(!m.contains_key("world"));
        assert!(m.find("hello").is_some());
    }

    /// Invariant: A removed slot's id never resolves again, even after the
    /// physical slot is reused.
    #[test]
    fn stale_id_does_not_alias_new_entry() {
        let mut m: HandleTable<String, i32> = HandleTable::new();
        let s1 = m.insert("old".to_string(), 1).unwrap();
        let id1 = s1.to_id();
        m.remove(s1).unwrap();
        let s2 = m.insert("new".to_string(), 2).unwrap();
        assert_ne!(id1, s2.to_id());
        let stale = Slot::from_id(id1).unwrap();
        assert!(m.get(stale).is_none());
        assert_eq!(m.get(Slot::from_id(s2.to_id()).unwrap()), Some(&2));
    }

    #[test]
    fn ids_are_never_zero() {
        let mut m: HandleTable<u32, ()> = HandleTable::new();
        for i in 0..16 {
            let s = m.insert(i, ()).unwrap();
            assert_ne!(s.to_id(), 0);
        }
        assert!(Slot::from_id(0).is_none());
    }

    /// Invariant: `insert_with` only runs the constructor on a successful insert.
    #[test]
    fn insert_with_is_lazy_and_deduplicates() {
        let mut m: HandleTable<String, String> = HandleTable::new();
        let calls = Cell::new(0);
        m.insert_with("k".to_string(), || {
            calls.set(calls.get() + 1);
            "v".to_string()
        })
        .unwrap();
        let dup = m.insert_with("k".to_string(), || {
            calls.set(calls.get() + 1);
            "v2".to_string()
        });
        assert_eq!(dup, Err(InsertError::DuplicateKey));
        assert_eq!(calls.get(), 1, "default() must not run on duplicate");
    }

    /// Invariant: After `remove`, the key is absent and can be reinserted.
    /// Invariant: `find_or_insert_with` returns the existing slot for a present
    /// key without running `default`, and reports whether it inserted.
    #[test]
    fn find_or_insert_with_reuses_existing_slot() {
        let mut m: HandleTable<&'static str, i32> = HandleTable::new();
        let (s1, inserted) = m.find_or_insert_with("k", || 1);
        assert!(inserted);
        let (s2, inserted) = m.find_or_insert_with("k", || panic!("default ran for a present key"));
        assert!(!inserted);
        assert_eq!(s1, s2);
        assert_eq!(m.get(s1), Some(&1));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn remove_then_reinsert_same_key() {
        let mut m: HandleTable<String, i32> = HandleTable::new();
        let s1 = m.insert("k".to_string(), 1).unwrap();
        assert_eq!(m.remove(s1), Some(("k".to_string(), 1)));
        assert!(!m.contains_key("k"));
        assert!(m.remove(s1).is_none());

        let s2 = m.insert("k".to_string(), 2).unwrap();
        assert_eq!(m.find("k"), Some(s2));
        assert_eq!(m.key(s2).map(String::as_str), Some("k"));
        assert_eq!(m.iter().count(), 1);
    }
}
