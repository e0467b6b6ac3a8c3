// File: src/table.rs
//
// Open-addressed, insertion-ordered hash table keyed by `Value`. Backs
// string interning, class method/field tables, instance field tables,
// globals, and the `dict`/`set` builtins.
//
// Layout follows the compact-dict design (a dense, insertion-ordered entry
// list plus a sparse index array that maps hash buckets to entry slots)
// rather than the classic open-addressing-with-tombstones scheme, because
// the spec requires dict iteration to preserve insertion order even after
// deletions. Hashing/equality for heap-backed keys (strings, tuples) needs
// the owning `Heap`, which callers pass in explicitly (see heap.rs for why
// `Table` doesn't just hold a `&Heap` itself).

use crate::heap::Heap;
use crate::value::Value;

const EMPTY: i64 = -1;
const TOMBSTONE: i64 = -2;

#[derive(Clone)]
struct Entry {
    key: Value,
    value: Value,
    hash: u32,
    /// `false` once the entry has been deleted; the dense slot stays so
    /// iteration order of surviving entries is preserved without shifting.
    live: bool,
}

#[derive(Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Sparse index: maps `hash & (indices.len()-1)` probe chains to an
    /// index into `entries` (or EMPTY/TOMBSTONE).
    indices: Vec<i64>,
    live_count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), indices: Vec::new(), live_count: 0 }
    }

    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    fn ensure_capacity(&mut self, heap: &Heap) {
        if self.indices.is_empty() {
            self.indices = vec![EMPTY; 8];
            return;
        }
        // Grow once load factor would exceed 3/4, rebuilding the sparse index
        // from the still-live dense entries (this is also how tombstones get
        // reclaimed).
        if (self.entries.len() + 1) * 4 >= self.indices.len() * 3 {
            let new_cap = self.indices.len() * 2;
            self.rebuild_index(heap, new_cap);
        }
    }

    fn rebuild_index(&mut self, heap: &Heap, new_cap: usize) {
        let mut new_indices = vec![EMPTY; new_cap];
        let mut new_entries = Vec::with_capacity(self.live_count);
        for entry in self.entries.drain(..) {
            if !entry.live {
                continue;
            }
            let slot = Self::probe(&new_indices, &new_entries, heap, entry.hash, entry.key);
            new_indices[slot] = new_entries.len() as i64;
            new_entries.push(entry);
        }
        self.indices = new_indices;
        self.entries = new_entries;
    }

    /// Linear probe starting at `hash`'s home bucket; returns the slot that
    /// either already holds this key or is the first empty/tombstone slot.
    fn probe(indices: &[i64], entries: &[Entry], heap: &Heap, hash: u32, key: Value) -> usize {
        let mask = indices.len() - 1;
        let mut idx = hash as usize & mask;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match indices[idx] {
                EMPTY => return first_tombstone.unwrap_or(idx),
                TOMBSTONE => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                slot => {
                    let entry = &entries[slot as usize];
                    if entry.live && entry.hash == hash && heap.values_equal(entry.key, key) {
                        return idx;
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    pub fn get(&self, heap: &Heap, key: Value) -> Option<Value> {
        if self.indices.is_empty() {
            return None;
        }
        let hash = heap.hash_value(key)?;
        let slot = Self::probe(&self.indices, &self.entries, heap, hash, key);
        match self.indices[slot] {
            EMPTY | TOMBSTONE => None,
            i => {
                let e = &self.entries[i as usize];
                if e.live { Some(e.value) } else { None }
            }
        }
    }

    pub fn contains(&self, heap: &Heap, key: Value) -> bool {
        self.get(heap, key).is_some()
    }

    /// Returns `true` if this inserted a new key, `false` if it overwrote one.
    pub fn set(&mut self, heap: &Heap, key: Value, value: Value) -> bool {
        let Some(hash) = heap.hash_value(key) else {
            return false;
        };
        self.ensure_capacity(heap);
        let slot = Self::probe(&self.indices, &self.entries, heap, hash, key);
        match self.indices[slot] {
            EMPTY | TOMBSTONE => {
                let entry_idx = self.entries.len();
                self.entries.push(Entry { key, value, hash, live: true });
                self.indices[slot] = entry_idx as i64;
                self.live_count += 1;
                true
            }
            i => {
                self.entries[i as usize].value = value;
                false
            }
        }
    }

    pub fn delete(&mut self, heap: &Heap, key: Value) -> bool {
        if self.indices.is_empty() {
            return false;
        }
        let Some(hash) = heap.hash_value(key) else {
            return false;
        };
        let slot = Self::probe(&self.indices, &self.entries, heap, hash, key);
        match self.indices[slot] {
            EMPTY | TOMBSTONE => false,
            i => {
                self.entries[i as usize].live = false;
                self.indices[slot] = TOMBSTONE;
                self.live_count -= 1;
                true
            }
        }
    }

    /// Iterate live entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter(|e| e.live).map(|e| (e.key, e.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = Value> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Roots for the GC: every live key and value.
    pub fn gc_roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries.iter().filter(|e| e.live).flat_map(|e| [e.key, e.value])
    }

    /// String-keyed convenience used heavily by class/instance field tables,
    /// where keys are always interned `Value::Obj(String)`.
    pub fn get_str(&self, heap: &Heap, name: &str) -> Option<Value> {
        let key = heap.peek_interned(name)?;
        self.get(heap, key)
    }
}
