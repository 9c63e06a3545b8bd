//! Open-addressed hash table keyed by interned strings.
//!
//! Keys are interned string [`HeapId`]s with their FNV-1a hash cached per
//! entry, so probing never has to touch the heap: interning guarantees that
//! id equality coincides with byte equality. Deleted entries become
//! tombstones, which probe sequences treat as occupied so that later entries
//! in the same cluster stay reachable. Backing storage is a power-of-two
//! array grown at 75% load (tombstones included, as in the classic scheme).
//!
//! The table backs globals, class method tables, instance fields, and the
//! map value type.

use crate::{heap::HeapId, value::Value};

const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;
const INITIAL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Default)]
enum Entry {
    #[default]
    Vacant,
    /// Left behind by `delete`; keeps probe chains intact.
    Tombstone,
    Live { key: HeapId, hash: u32, value: Value },
}

/// Hash table mapping interned strings to values.
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    entries: Vec<Entry>,
    /// Live entries plus tombstones; drives the load-factor check.
    count: usize,
    live: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Looks up `key`, returning its value if present.
    pub fn get(&self, key: HeapId, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        match &self.entries[self.find_slot(key, hash)] {
            Entry::Live { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Inserts or updates `key`. Returns `true` if the key was not present.
    pub fn set(&mut self, key: HeapId, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DENOMINATOR > self.entries.len() * MAX_LOAD_NUMERATOR {
            self.grow();
        }
        let slot = self.find_slot(key, hash);
        let is_new = !matches!(self.entries[slot], Entry::Live { .. });
        if is_new {
            // Reusing a tombstone does not raise the load; a fresh slot does.
            if matches!(self.entries[slot], Entry::Vacant) {
                self.count += 1;
            }
            self.live += 1;
        }
        self.entries[slot] = Entry::Live { key, hash, value };
        is_new
    }

    /// Removes `key`, leaving a tombstone. Returns `true` if it was present.
    pub fn delete(&mut self, key: HeapId, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = self.find_slot(key, hash);
        if matches!(self.entries[slot], Entry::Live { .. }) {
            self.entries[slot] = Entry::Tombstone;
            self.live -= 1;
            true
        } else {
            false
        }
    }

    /// Copies every entry of `other` into `self`. Existing keys are
    /// overwritten; used to seed a subclass method table from its superclass.
    pub fn add_all(&mut self, other: &Self) {
        for entry in &other.entries {
            if let Entry::Live { key, hash, value } = entry {
                self.set(*key, *hash, *value);
            }
        }
    }

    /// Iterates live `(key, value)` pairs in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (HeapId, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Live { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Probes for `key`, returning the slot holding it, or the slot an insert
    /// should use (the first tombstone on the probe path, else the vacant
    /// slot that terminated the probe).
    fn find_slot(&self, key: HeapId, hash: u32) -> usize {
        debug_assert!(self.entries.len().is_power_of_two());
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            match &self.entries[index] {
                Entry::Vacant => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Live { key: existing, .. } => {
                    if *existing == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Doubles capacity and re-inserts live entries, dropping tombstones.
    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::Vacant; capacity]);
        self.count = 0;
        self.live = 0;
        for entry in old {
            if let Entry::Live { key, hash, value } = entry {
                let slot = self.find_slot(key, hash);
                self.entries[slot] = Entry::Live { key, hash, value };
                self.count += 1;
                self.live += 1;
            }
        }
    }

    /// Approximate backing-store footprint, for GC accounting.
    pub fn footprint(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }
}
