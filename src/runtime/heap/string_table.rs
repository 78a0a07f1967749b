use std::sync::Arc;

use dashmap::DashMap;

use crate::runtime::{Reference, heap::Heap};

/// Interned strings: literals from constant pools and `String.intern`.
/// Entries are never removed, so interned strings are permanent roots.
pub(crate) struct StringTable {
    map: DashMap<Arc<str>, Reference>,
}

impl StringTable {
    pub(in crate::runtime) fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    pub(crate) fn get(&self, value: &str) -> Option<Reference> {
        self.map.get(value).map(|r| *r.value())
    }

    /// Interns `string` as the object for `value` unless another thread got
    /// there first; returns the winner.
    pub(crate) fn insert(&self, value: Arc<str>, string: Reference) -> Reference {
        *self.map.entry(value).or_insert(string).value()
    }

    pub(crate) fn references(&self) -> Vec<Reference> {
        self.map.iter().map(|e| *e.value()).collect()
    }
}

impl Heap {
    /// Contents of a `java/lang/String`, given the slot of its `value` field.
    pub(crate) fn read_string(&self, string: Reference, value_slot: u16) -> Option<String> {
        let object = self.get(string)?;
        if object.class.instance_slots <= value_slot as usize {
            return None;
        }
        let chars = self.get(object.get_field(value_slot) as Reference)?;
        let units: Vec<u16> = chars.elements().map(|c| c as u16).collect();
        Some(String::from_utf16_lossy(&units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_insert_wins() {
        let table = StringTable::new();
        assert_eq!(table.insert(Arc::from("a"), 3), 3);
        assert_eq!(table.insert(Arc::from("a"), 4), 3);
        assert_eq!(table.get("a"), Some(3));
        assert_eq!(table.get("b"), None);
        assert_eq!(table.references(), vec![3]);
    }
}
