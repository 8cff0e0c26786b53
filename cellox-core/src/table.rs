//! Open-addressed hash table with linear probing, power-of-two capacity,
//! and tombstone deletion (§3 component 4). Used for globals, class
//! method tables, instance field tables, and (by the heap's interner)
//! the string intern set.
//!
//! Keys are [`HeapId`]s of interned `String` objects. A table never
//! dereferences the heap itself — callers supply each key's FNV-1a hash
//! (cheaply available wherever a key is obtained, since every interned
//! string carries its own cached hash). This keeps `Table` heap-agnostic,
//! which matters because method/field tables live *nested inside* heap
//! objects (`Class`, `Instance`): an API that took `&Heap` internally
//! would force a table operation to borrow the same arena its own
//! storage lives in.

use crate::heap::{Heap, HeapId};
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

#[derive(Clone)]
enum Entry {
    Empty,
    Tombstone,
    Occupied { key: HeapId, hash: u32, value: Value },
}

/// A single open-addressed hash table.
#[derive(Clone)]
pub struct Table {
    entries: Vec<Entry>,
    /// Occupied + tombstone count (tombstones are NOT reclaimed until the
    /// next grow, matching the growth-trigger behaviour of the original
    /// implementation).
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Entry::Occupied { .. }))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Finds the slot a key with the given hash should occupy: either the
    /// entry already holding `key`, or the first empty/tombstone slot
    /// found while probing (preferring the earliest tombstone, so deleted
    /// slots get reclaimed on insert).
    fn probe(&self, hash: u32, key: HeapId) -> usize {
        let capacity = self.capacity();
        debug_assert!(capacity.is_power_of_two());
        let mut index = (hash as usize) & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            match &self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Occupied { key: k, .. } if *k == key => return index,
                Entry::Occupied { .. } => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    #[must_use]
    pub fn get(&self, key: HeapId, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match &self.entries[self.probe(hash, key)] {
            Entry::Occupied { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn contains(&self, key: HeapId, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Inserts or overwrites `key`. Returns `true` if this added a new key.
    pub fn set(&mut self, key: HeapId, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * TABLE_MAX_LOAD {
            self.grow();
        }
        let index = self.probe(hash, key);
        let is_new = !matches!(self.entries[index], Entry::Occupied { .. });
        if is_new && matches!(self.entries[index], Entry::Empty) {
            self.count += 1;
        }
        self.entries[index] = Entry::Occupied { key, hash, value };
        is_new
    }

    /// Tombstone deletion: keeps the probe sequence of later entries intact.
    pub fn delete(&mut self, key: HeapId, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = self.probe(hash, key);
        if matches!(self.entries[index], Entry::Occupied { .. }) {
            self.entries[index] = Entry::Tombstone;
            true
        } else {
            false
        }
    }

    fn grow(&mut self) {
        let new_capacity = (self.capacity() * 2).max(MIN_CAPACITY);
        let old_entries = std::mem::replace(&mut self.entries, vec![(); new_capacity].iter().map(|()| Entry::Empty).collect());
        self.count = 0;
        for entry in old_entries {
            if let Entry::Occupied { key, hash, value } = entry {
                // Reinsert by hand: tombstones are dropped during a grow, so
                // this never needs the max-load check `set` performs.
                let index = self.probe(hash, key);
                self.entries[index] = Entry::Occupied { key, hash, value };
                self.count += 1;
            }
        }
    }

    /// Locates an interned string by content, for use before the
    /// candidate string exists as a `HeapId` of its own (the intern path).
    #[must_use]
    pub fn find_string(&self, heap: &Heap, bytes: &[u8], hash: u32) -> Option<HeapId> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            match &self.entries[index] {
                Entry::Empty => return None,
                Entry::Occupied { key, hash: h, .. } => {
                    if *h == hash && heap.string_bytes(*key) == bytes {
                        return Some(*key);
                    }
                }
                Entry::Tombstone => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Iterates occupied `(key, value)` pairs. Used by the GC to mark
    /// table contents, by `OP_INHERIT` to copy a superclass's methods,
    /// and by the heap's weak-root sweep over the string intern set.
    pub fn iter(&self) -> impl Iterator<Item = (HeapId, u32, Value)> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Occupied { key, hash, value } => Some((*key, *hash, *value)),
            _ => None,
        })
    }

    /// Removes every entry whose key fails `keep`. Used by the heap's weak
    /// sweep over the intern set: unmarked strings are dropped from the
    /// table without keeping them artificially alive.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(HeapId) -> bool) {
        for entry in &mut self.entries {
            if let Entry::Occupied { key, .. } = entry
                && !keep(*key)
            {
                *entry = Entry::Tombstone;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn intern(heap: &mut Heap, s: &str) -> (HeapId, u32) {
        let id = heap.intern_string(s.as_bytes());
        (id, heap.string_hash(id))
    }

    #[test]
    fn set_get_delete_round_trip() {
        let mut heap = Heap::new();
        let (k1, h1) = intern(&mut heap, "a");
        let (k2, h2) = intern(&mut heap, "b");
        let mut table = Table::new();
        assert!(table.set(k1, h1, Value::number(1.0)));
        assert!(table.set(k2, h2, Value::number(2.0)));
        assert!(!table.set(k1, h1, Value::number(3.0)));
        assert_eq!(table.get(k1, h1), Some(Value::number(3.0)));
        assert!(table.delete(k1, h1));
        assert_eq!(table.get(k1, h1), None);
        assert_eq!(table.get(k2, h2), Some(Value::number(2.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let mut keys = Vec::new();
        for i in 0..40 {
            let (k, h) = intern(&mut heap, &format!("key{i}"));
            table.set(k, h, Value::number(f64::from(i)));
            keys.push((k, h));
        }
        for (i, (k, h)) in keys.iter().enumerate() {
            assert_eq!(table.get(*k, *h), Some(Value::number(f64::from(i as i32))));
        }
    }

    #[test]
    fn find_string_locates_by_content_before_key_is_known() {
        let mut heap = Heap::new();
        let (k, h) = intern(&mut heap, "hello");
        let mut table = Table::new();
        table.set(k, h, Value::boolean(true));
        let found = table.find_string(&heap, b"hello", h);
        assert_eq!(found, Some(k));
        assert_eq!(table.find_string(&heap, b"nope", h), None);
    }

    #[test]
    fn inherit_copies_all_entries() {
        let mut heap = Heap::new();
        let (k1, h1) = intern(&mut heap, "greet");
        let mut base = Table::new();
        base.set(k1, h1, Value::number(1.0));
        let mut sub = Table::new();
        for (k, h, v) in base.iter() {
            sub.set(k, h, v);
        }
        assert_eq!(sub.get(k1, h1), Some(Value::number(1.0)));
    }
}
