//! Open-addressed hash table keyed by `Value`.
//!
//! Power-of-two capacity, linear probing, tombstones. Keys must be non-nil;
//! a nil key with a `true` value marks a tombstone. Because strings are
//! interned, key equality is plain value equality (object identity) and
//! only hashing needs the heap.

use crate::Value;
use crate::gc::Heap;
use crate::object::ObjHandle;

const FNV_OFFSET_BASIS: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// 32-bit FNV-1a over raw bytes; the hash cached in every interned string.
pub fn hash_str(s: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash of a key value: cached FNV-1a for strings, XOR of the IEEE word
/// halves for numbers, 0/1 for booleans. Nil is never hashable; other
/// objects hash to 0 and rely on identity equality.
pub fn hash_value(heap: &Heap, value: Value) -> u32 {
    if let Some(handle) = value.as_obj() {
        if let crate::Obj::String(s) = heap.get(handle) {
            return s.hash;
        }
        return 0;
    }
    if value.is_number() {
        let bits = value.as_number().to_bits();
        return (bits >> 32) as u32 ^ bits as u32;
    }
    if value.is_bool() {
        return u32::from(value.as_bool());
    }
    0
}

#[derive(Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: Value::NIL,
        value: Value::NIL,
    };
}

/// The table. `max_load` controls when the entry array doubles.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
    max_load: f64,
}

impl Default for Table {
    fn default() -> Table {
        Table::new(0.75)
    }
}

impl Table {
    pub fn new(max_load: f64) -> Table {
        debug_assert!(max_load > 0.0 && max_load <= 1.0);
        Table {
            count: 0,
            entries: Vec::new(),
            max_load,
        }
    }

    /// Number of live entries plus tombstones.
    pub fn count(&self) -> usize {
        self.count
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for `key`. Returns the slot holding the key, or the slot a new
    /// entry should go in (the first tombstone on the probe path, if any).
    fn find_entry(entries: &[Entry], hash: u32, key: Value) -> Option<usize> {
        let capacity = entries.len();
        let mut index = hash as usize & (capacity - 1);
        let mut tombstone = None;

        for _ in 0..capacity {
            let entry = &entries[index];
            if entry.key.is_nil() {
                if entry.value.is_nil() {
                    // Empty entry.
                    return Some(tombstone.unwrap_or(index));
                }
                // A tombstone; keep probing but remember it.
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key.equals(key) {
                return Some(index);
            }

            index = (index + 1) & (capacity - 1);
        }

        // Only reachable when the table is filled to capacity.
        tombstone
    }

    pub fn get(&self, heap: &Heap, key: Value) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let hash = hash_value(heap, key);
        let index = Self::find_entry(&self.entries, hash, key)?;
        let entry = &self.entries[index];
        if entry.key.is_nil() {
            return None;
        }
        Some(entry.value)
    }

    /// Insert or update. Returns true when the key was not present.
    pub fn set(&mut self, heap: &Heap, key: Value, value: Value) -> bool {
        debug_assert!(!key.is_nil());

        if (self.count + 1) as f64 > self.capacity() as f64 * self.max_load {
            let capacity = if self.capacity() < 8 {
                8
            } else {
                self.capacity() * 2
            };
            self.adjust_capacity(heap, capacity);
        }

        let hash = hash_value(heap, key);
        let index = match Self::find_entry(&self.entries, hash, key) {
            Some(index) => index,
            None => return false,
        };
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_nil();
        if is_new && entry.value.is_nil() {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new
    }

    /// Remove a key, leaving a tombstone so probe chains stay intact.
    pub fn delete(&mut self, heap: &Heap, key: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let hash = hash_value(heap, key);
        let Some(index) = Self::find_entry(&self.entries, hash, key) else {
            return false;
        };
        let entry = &mut self.entries[index];
        if entry.key.is_nil() {
            return false;
        }
        entry.key = Value::NIL;
        entry.value = Value::TRUE;
        true
    }

    fn adjust_capacity(&mut self, heap: &Heap, capacity: usize) {
        let mut entries = vec![Entry::EMPTY; capacity];
        self.count = 0;
        for entry in &self.entries {
            if entry.key.is_nil() {
                continue;
            }
            let hash = hash_value(heap, entry.key);
            if let Some(dest) = Self::find_entry(&entries, hash, entry.key) {
                entries[dest] = *entry;
                self.count += 1;
            }
        }
        self.entries = entries;
    }

    /// Copy every live entry of `from` into `to`.
    pub fn add_all(heap: &Heap, from: &Table, to: &mut Table) {
        for (key, value) in from.iter() {
            to.set(heap, key, value);
        }
    }

    /// Probe for an interned string by contents without allocating one.
    pub fn find_string(&self, heap: &Heap, chars: &str, hash: u32) -> Option<ObjHandle> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = hash as usize & (capacity - 1);
        for _ in 0..capacity {
            let entry = &self.entries[index];
            if entry.key.is_nil() {
                // Stop at an empty non-tombstone entry.
                if entry.value.is_nil() {
                    return None;
                }
            } else if let Some(handle) = entry.key.as_obj() {
                if let crate::Obj::String(s) = heap.get(handle) {
                    if s.hash == hash && s.chars == chars {
                        return Some(handle);
                    }
                }
            }
            index = (index + 1) & (capacity - 1);
        }
        None
    }

    /// Tombstone every entry whose object key fails `is_white`. The GC runs
    /// this over the intern table between marking and sweeping.
    pub fn remove_white(&mut self, mut is_white: impl FnMut(ObjHandle) -> bool) {
        for entry in &mut self.entries {
            if let Some(handle) = entry.key.as_obj() {
                if is_white(handle) {
                    entry.key = Value::NIL;
                    entry.value = Value::TRUE;
                }
            }
        }
    }

    /// Live entries, in probe order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.key.is_nil())
            .map(|e| (e.key, e.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DebugOptions;
    use crate::Gc;

    fn gc() -> Gc {
        Gc::new(&DebugOptions::default())
    }

    #[test]
    fn test_get_set_delete() {
        let mut gc = gc();
        let foo = Value::obj(gc.intern_new("foo"));
        let bar = Value::obj(gc.intern_new("bar"));
        let mut table = Table::default();

        // Empty table has no keys to read or delete.
        assert!(table.get(gc.heap(), foo).is_none());
        assert!(!table.delete(gc.heap(), foo));

        // Insert, then update.
        assert!(table.set(gc.heap(), foo, Value::number(1.0)));
        assert!(!table.set(gc.heap(), foo, Value::number(2.0)));
        let got = table.get(gc.heap(), foo);
        assert!(got.is_some_and(|v| v.equals(Value::number(2.0))));
        assert!(table.get(gc.heap(), bar).is_none());

        // Delete leaves no phantom entry behind.
        assert!(table.delete(gc.heap(), foo));
        assert!(!table.delete(gc.heap(), foo));
        assert!(table.get(gc.heap(), foo).is_none());
    }

    #[test]
    fn test_last_write_wins_through_tombstones() {
        let mut gc = gc();
        let keys: Vec<Value> = (0..64)
            .map(|i| Value::obj(gc.intern_new(&format!("k{}", i))))
            .collect();
        let mut table = Table::default();

        for (i, key) in keys.iter().enumerate() {
            table.set(gc.heap(), *key, Value::number(i as f64));
        }
        // Delete half, reinsert with new values, and verify every lookup
        // returns the last value written.
        for key in keys.iter().step_by(2) {
            assert!(table.delete(gc.heap(), *key));
        }
        for (i, key) in keys.iter().enumerate().step_by(2) {
            table.set(gc.heap(), *key, Value::number(i as f64 + 100.0));
        }
        for (i, key) in keys.iter().enumerate() {
            let expected = if i % 2 == 0 { i as f64 + 100.0 } else { i as f64 };
            let got = table.get(gc.heap(), *key);
            assert!(got.is_some_and(|v| v.equals(Value::number(expected))));
        }
    }

    #[test]
    fn test_number_and_bool_keys() {
        let gc = gc();
        let mut table = Table::default();
        table.set(gc.heap(), Value::number(3.5), Value::TRUE);
        table.set(gc.heap(), Value::TRUE, Value::number(1.0));
        assert!(table.get(gc.heap(), Value::number(3.5)).is_some());
        assert!(table.get(gc.heap(), Value::TRUE).is_some());
        assert!(table.get(gc.heap(), Value::FALSE).is_none());
    }

    #[test]
    fn test_add_all() {
        let mut gc = gc();
        let a = Value::obj(gc.intern_new("a"));
        let b = Value::obj(gc.intern_new("b"));
        let mut from = Table::default();
        let mut to = Table::default();
        from.set(gc.heap(), a, Value::number(1.0));
        from.set(gc.heap(), b, Value::number(2.0));
        to.set(gc.heap(), b, Value::number(9.0));

        Table::add_all(gc.heap(), &from, &mut to);
        assert!(to.get(gc.heap(), a).is_some_and(|v| v.equals(Value::number(1.0))));
        assert!(to.get(gc.heap(), b).is_some_and(|v| v.equals(Value::number(2.0))));
    }

    #[test]
    fn test_find_string_probes_without_allocating() {
        let mut gc = gc();
        let handle = gc.intern_new("interned");
        // The intern table answers content probes with the existing handle.
        assert_eq!(gc.find_string("interned"), Some(handle));
        assert_eq!(gc.find_string("missing"), None);
        assert_eq!(gc.find_string("Interned"), None);
    }

    #[test]
    fn test_full_table_with_max_load_one() {
        let gc = gc();
        let mut table = Table::new(1.0);
        for i in 0..32 {
            table.set(gc.heap(), Value::number(i as f64), Value::number(i as f64));
        }
        for i in 0..32 {
            assert!(table.get(gc.heap(), Value::number(i as f64)).is_some());
        }
    }
}
