//! Open-addressed hash table: linear probing, power-of-two capacity, 75%
//! load factor, tombstone deletion. Keys are interned strings (identified by
//! `ObjId`); callers supply the key's precomputed hash so this module never
//! needs to touch the heap for the common get/set/delete path.
//!
//! One `Table` implementation backs four distinct tables in the engine: the
//! VM's globals, every class's method table, every instance's field table,
//! and the interned-string table itself (whose content-based lookup is
//! `find_string`).

use crate::heap::Heap;
use crate::object::ObjId;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { key: ObjId, hash: u32, value: Value },
}

#[derive(Default)]
pub struct Table {
    entries: Vec<Slot>,
    /// Live entries plus tombstones; used to decide when to grow.
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Self { entries: Vec::new(), count: 0 }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Slot], capacity: usize, key: ObjId, hash: u32) -> usize {
        let mut index = hash as usize & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied { key: k, .. } if *k == key => return index,
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow_capacity(capacity: usize) -> usize {
        if capacity < 8 { 8 } else { capacity * 2 }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Slot::Empty; 0];
        entries.resize_with(capacity, || Slot::Empty);

        let mut live = 0;
        for slot in std::mem::take(&mut self.entries) {
            if let Slot::Occupied { key, hash, value } = slot {
                let index = Self::find_entry(&entries, capacity, key, hash);
                entries[index] = Slot::Occupied { key, hash, value };
                live += 1;
            }
        }
        self.entries = entries;
        self.count = live;
    }

    pub fn get(&self, key: ObjId, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key, hash);
        match &self.entries[index] {
            Slot::Occupied { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn contains(&self, key: ObjId, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Inserts or overwrites `key`. Returns `true` if this introduced a new
    /// key (matching clox's `tableSet` return value, which the compiler
    /// uses to distinguish "declare" from "redefine").
    pub fn set(&mut self, key: ObjId, hash: u32, value: Value) -> bool {
        if self.count + 1 > (self.capacity() as f64 * MAX_LOAD) as usize {
            let capacity = Self::grow_capacity(self.capacity());
            self.adjust_capacity(capacity);
        }

        let capacity = self.capacity();
        let index = Self::find_entry(&self.entries, capacity, key, hash);
        let is_new_key = !matches!(self.entries[index], Slot::Occupied { .. });
        if is_new_key && matches!(self.entries[index], Slot::Empty) {
            self.count += 1;
        }
        self.entries[index] = Slot::Occupied { key, hash, value };
        is_new_key
    }

    pub fn delete(&mut self, key: ObjId, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key, hash);
        if !matches!(self.entries[index], Slot::Occupied { .. }) {
            return false;
        }
        self.entries[index] = Slot::Tombstone;
        true
    }

    /// Copies every entry of `src` into `self`, used by the `Inherit`
    /// opcode to seed a subclass's method table from its superclass.
    pub fn add_all(&mut self, src: &Table) {
        for slot in &src.entries {
            if let Slot::Occupied { key, hash, value } = slot {
                self.set(*key, *hash, *value);
            }
        }
    }

    /// Content-based lookup used only by the string interner: finds an
    /// already-interned string with these exact bytes, without needing its
    /// `ObjId` up front (which is precisely what this call is trying to
    /// discover).
    pub fn find_string(&self, heap: &Heap, bytes: &[u8], hash: u32) -> Option<ObjId> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = hash as usize & (capacity - 1);
        loop {
            match &self.entries[index] {
                Slot::Empty => return None,
                Slot::Occupied { key, hash: entry_hash, .. } => {
                    if *entry_hash == hash {
                        let candidate = heap.obj(*key).as_string().expect("intern table keys are strings");
                        if candidate.bytes.as_ref() == bytes {
                            return Some(*key);
                        }
                    }
                }
                Slot::Tombstone => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Deletes every entry whose key object is unmarked. Only the
    /// interned-string table calls this, between tracing and sweep, so that
    /// strings the sweep is about to free don't linger as dangling keys.
    pub fn remove_white(&mut self, heap: &Heap) {
        for slot in &mut self.entries {
            if let Slot::Occupied { key, .. } = slot
                && !heap.is_marked(*key)
            {
                *slot = Slot::Tombstone;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjId, Value)> + '_ {
        self.entries.iter().filter_map(|slot| match slot {
            Slot::Occupied { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    pub fn approx_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Slot>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> ObjId {
        // Test-only: construct ids directly since these tests never touch a
        // real heap, only the table's own bookkeeping.
        ObjId::from_index(n as usize)
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let mut table = Table::new();
        assert!(table.set(id(1), 100, Value::Number(1.0)));
        assert!(!table.set(id(1), 100, Value::Number(2.0)));
        assert_eq!(table.get(id(1), 100), Some(Value::Number(2.0)));
        assert!(table.delete(id(1), 100));
        assert_eq!(table.get(id(1), 100), None);
    }

    #[test]
    fn grows_past_load_factor_without_losing_entries() {
        let mut table = Table::new();
        for i in 0..200u32 {
            table.set(id(i), i.wrapping_mul(2_654_435_761), Value::Number(f64::from(i)));
        }
        for i in 0..200u32 {
            assert_eq!(table.get(id(i), i.wrapping_mul(2_654_435_761)), Some(Value::Number(f64::from(i))));
        }
    }

    #[test]
    fn tombstones_do_not_break_subsequent_probes() {
        let mut table = Table::new();
        table.set(id(1), 8, Value::Nil);
        table.set(id(2), 8, Value::Nil); // collides with key 1's bucket
        table.delete(id(1), 8);
        assert_eq!(table.get(id(2), 8), Some(Value::Nil));
    }
}
