//! CountedTable: per-entry reference counting atop HandleTable.
//!
//! This is the bookkeeping a provider keeps behind its id-based
//! `open`/`add_ref`/`release` calls. Ids cross an FFI-shaped boundary, so
//! counts are plain integers rather than tokens; the token discipline lives
//! on the owning side (`tokens::NativeCount`).

use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;

use crate::handle_table::{HandleTable, Slot};

#[derive(Debug)]
pub struct Counted<V> {
    pub refcount: usize,
    pub value: V,
}

pub struct CountedTable<K, V, S = RandomState> {
    inner: HandleTable<K, Counted<V>, S>,
}

/// Result of returning a reference.
#[derive(Debug, PartialEq, Eq)]
pub enum PutResult<K, V> {
    /// The slot does not name a live entry.
    Stale,
    /// The entry is still referenced.
    Live(usize),
    /// The last reference was returned and the entry removed.
    Removed { key: K, value: V },
}

impl<K, V> CountedTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HandleTable::new(),
        }
    }
}

impl<K, V> Default for CountedTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> CountedTable<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Take one reference to the entry for `key`, inserting it with
    /// `default()` if absent. `default` only runs on insertion.
    pub fn acquire_with<F>(&mut self, key: K, default: F) -> Slot
    where
        F: FnOnce() -> V,
    {
        let (slot, _) = self.inner.find_or_insert_with(key, || Counted {
            refcount: 0,
            value: default(),
        });
        if let Some(entry) = self.inner.get_mut(slot) {
            entry.refcount += 1;
        }
        slot
    }

    /// Add one reference to a live entry. Returns false for a stale slot.
    pub fn get(&mut self, slot: Slot) -> bool {
        match self.inner.get_mut(slot) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Return one reference; removes and yields `(K, V)` when the count
    /// reaches zero.
    pub fn put(&mut self, slot: Slot) -> PutResult<K, V> {
        let remaining = match self.inner.get_mut(slot) {
            Some(entry) => {
                debug_assert!(entry.refcount > 0, "CountedTable underflow");
                entry.refcount -= 1;
                entry.refcount
            }
            None => return PutResult::Stale,
        };
        if remaining > 0 {
            return PutResult::Live(remaining);
        }
        match self.inner.remove(slot) {
            Some((key, counted)) => PutResult::Removed {
                key,
                value: counted.value,
            },
            None => PutResult::Stale,
        }
    }

    /// Current count; zero for a stale slot.
    pub fn count(&self, slot: Slot) -> usize {
        self.inner.get(slot).map(|c| c.refcount).unwrap_or(0)
    }

    pub fn value(&self, slot: Slot) -> Option<&V> {
        self.inner.get(slot).map(|c| &c.value)
    }

    pub fn key(&self, slot: Slot) -> Option<&K> {
        self.inner.key(slot)
    }
}
