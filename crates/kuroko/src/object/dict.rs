//! Value-keyed hash table backing `dict` and `set`.
//!
//! Open addressing is provided by a [`hashbrown::HashTable`] of entry
//! indices; the entries themselves live in an insertion-ordered vector with
//! tombstoned removal and periodic compaction. Key hashing and equality go
//! through [`crate::value::value_hash`]/[`crate::value::value_eq`], which
//! never re-enter user code.

use hashbrown::HashTable;

use crate::{
    exception::{ExcType, RunError, RunResult},
    heap::Heap,
    value::{Value, value_eq, value_hash},
};

#[derive(Debug)]
struct Entry {
    hash: u32,
    key: Value,
    value: Value,
    dead: bool,
}

/// An insertion-ordered mapping keyed by arbitrary hashable values.
#[derive(Debug, Default)]
pub struct Dict {
    entries: Vec<Entry>,
    index: HashTable<u32>,
    live: usize,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn key_hash(heap: &Heap, key: Value) -> RunResult<u32> {
        value_hash(heap, key)
            .ok_or_else(|| RunError::exc(ExcType::TypeError, format!("unhashable type: '{}'", key.type_name(heap))))
    }

    fn find_index(&self, heap: &Heap, hash: u32, key: Value) -> Option<u32> {
        self.index
            .find(u64::from(hash), |&i| {
                let entry = &self.entries[i as usize];
                !entry.dead && entry.hash == hash && value_eq(heap, entry.key, key)
            })
            .copied()
    }

    pub fn get(&self, heap: &Heap, key: Value) -> RunResult<Option<Value>> {
        let hash = Self::key_hash(heap, key)?;
        Ok(self.find_index(heap, hash, key).map(|i| self.entries[i as usize].value))
    }

    pub fn contains(&self, heap: &Heap, key: Value) -> RunResult<bool> {
        let hash = Self::key_hash(heap, key)?;
        Ok(self.find_index(heap, hash, key).is_some())
    }

    /// Inserts or replaces, returning the previous value if the key existed.
    pub fn insert(&mut self, heap: &Heap, key: Value, value: Value) -> RunResult<Option<Value>> {
        let hash = Self::key_hash(heap, key)?;
        if let Some(i) = self.find_index(heap, hash, key) {
            let slot = &mut self.entries[i as usize];
            let old = slot.value;
            slot.value = value;
            return Ok(Some(old));
        }
        let i = u32::try_from(self.entries.len()).map_err(|_| RunError::internal("dict exceeds u32 entries"))?;
        self.entries.push(Entry {
            hash,
            key,
            value,
            dead: false,
        });
        let entries = &self.entries;
        self.index
            .insert_unique(u64::from(hash), i, |&j| u64::from(entries[j as usize].hash));
        self.live += 1;
        Ok(None)
    }

    /// Removes a key, returning its value if present.
    pub fn remove(&mut self, heap: &Heap, key: Value) -> RunResult<Option<Value>> {
        let hash = Self::key_hash(heap, key)?;
        let Some(i) = self.find_index(heap, hash, key) else {
            return Ok(None);
        };
        match self.index.find_entry(u64::from(hash), |&j| j == i) {
            Ok(occupied) => {
                occupied.remove();
            }
            Err(_) => return Err(RunError::internal("dict index desynchronized")),
        }
        let slot = &mut self.entries[i as usize];
        slot.dead = true;
        let value = slot.value;
        slot.key = Value::None;
        slot.value = Value::None;
        self.live -= 1;
        if self.entries.len() > 8 && self.live < self.entries.len() / 2 {
            self.compact();
        }
        Ok(Some(value))
    }

    /// Live `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter(|e| !e.dead).map(|e| (e.key, e.value))
    }

    /// Live pairs with mutable access to the values (used by `update`).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Value, &mut Value)> {
        self.entries.iter_mut().filter(|e| !e.dead).map(|e| (e.key, &mut e.value))
    }

    /// Drops tombstones and rebuilds the probe index.
    fn compact(&mut self) {
        self.entries.retain(|e| !e.dead);
        self.index.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            let i = u32::try_from(i).expect("compacted dict exceeds u32 entries");
            let entries = &self.entries;
            self.index
                .insert_unique(u64::from(entry.hash), i, |&j| u64::from(entries[j as usize].hash));
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.entries.capacity() * std::mem::size_of::<Entry>()
    }
}

/// A hash set over the same table, storing only keys.
#[derive(Debug, Default)]
pub struct Set {
    table: Dict,
}

impl Set {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn add(&mut self, heap: &Heap, value: Value) -> RunResult<bool> {
        Ok(self.table.insert(heap, value, Value::None)?.is_none())
    }

    pub fn contains(&self, heap: &Heap, value: Value) -> RunResult<bool> {
        self.table.contains(heap, value)
    }

    pub fn discard(&mut self, heap: &Heap, value: Value) -> RunResult<bool> {
        Ok(self.table.remove(heap, value)?.is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.table.iter().map(|(k, _)| k)
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        self.table.estimate_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let heap = Heap::new();
        let mut d = Dict::new();
        assert_eq!(d.insert(&heap, Value::Int(1), Value::Int(10)).unwrap(), None);
        assert_eq!(d.insert(&heap, Value::Int(2), Value::Int(20)).unwrap(), None);
        assert_eq!(d.get(&heap, Value::Int(1)).unwrap(), Some(Value::Int(10)));
        // Cross-promoted key equality: 1.0 finds the entry for 1.
        assert_eq!(d.get(&heap, Value::Float(1.0)).unwrap(), Some(Value::Int(10)));
        assert_eq!(d.remove(&heap, Value::Int(1)).unwrap(), Some(Value::Int(10)));
        assert_eq!(d.get(&heap, Value::Int(1)).unwrap(), None);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn replace_keeps_insertion_order() {
        let heap = Heap::new();
        let mut d = Dict::new();
        for i in 0..5 {
            d.insert(&heap, Value::Int(i), Value::Int(i)).unwrap();
        }
        d.insert(&heap, Value::Int(0), Value::Int(99)).unwrap();
        let keys: Vec<i64> = d.iter().map(|(k, _)| k.as_int().unwrap()).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unhashable_key_is_rejected() {
        let mut heap = Heap::new();
        let list = heap.allocate(crate::heap::HeapData::List(crate::object::List::default()));
        let mut d = Dict::new();
        assert!(d.insert(&heap, Value::Ref(list), Value::None).is_err());
    }

    #[test]
    fn compaction_preserves_contents() {
        let heap = Heap::new();
        let mut d = Dict::new();
        for i in 0..32 {
            d.insert(&heap, Value::Int(i), Value::Int(i * 2)).unwrap();
        }
        for i in 0..24 {
            d.remove(&heap, Value::Int(i)).unwrap();
        }
        assert_eq!(d.len(), 8);
        for i in 24..32 {
            assert_eq!(d.get(&heap, Value::Int(i)).unwrap(), Some(Value::Int(i * 2)));
        }
    }
}
