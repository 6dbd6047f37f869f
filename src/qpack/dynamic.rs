//! The QPACK dynamic table (RFC 9204 section 3.2): a bounded, append-only-until-evicted
//! ring of header fields, indexed by an ever-increasing absolute insertion count.

use std::collections::VecDeque;

use super::HeaderField;

struct Entry {
    field: HeaderField,
    /// Number of header blocks currently referencing this entry, across all streams.
    refs: usize,
}

/// Raised when an insertion can't be satisfied without evicting an entry that still
/// has an outstanding, unacknowledged reference.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InsertionBlocked;

impl std::fmt::Display for InsertionBlocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot evict an entry with an outstanding reference")
    }
}

impl std::error::Error for InsertionBlocked {}

pub struct DynamicTable {
    entries: VecDeque<Entry>,
    /// Absolute index of `entries[0]`; equals the total number of entries ever evicted.
    dropped: u64,
    capacity: usize,
    size: usize,
}

impl DynamicTable {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            dropped: 0,
            capacity: 0,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of insertions performed since the table was created.
    pub fn insert_count(&self) -> u64 {
        self.dropped + self.entries.len() as u64
    }

    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), InsertionBlocked> {
        self.capacity = capacity;
        self.evict_to_fit()?;
        Ok(())
    }

    fn evict_to_fit(&mut self) -> Result<(), InsertionBlocked> {
        while self.size > self.capacity {
            match self.entries.front() {
                Some(e) if e.refs == 0 => {
                    let e = self.entries.pop_front().unwrap();
                    self.size -= e.field.mem_size();
                    self.dropped += 1;
                }
                _ => return Err(InsertionBlocked),
            }
        }
        Ok(())
    }

    /// Insert a new entry, evicting from the front as needed. Returns the entry's
    /// absolute index, or `Err` if it doesn't fit without evicting a referenced entry.
    pub fn insert(&mut self, field: HeaderField) -> Result<u64, InsertionBlocked> {
        let needed = field.mem_size();
        if needed > self.capacity {
            return Err(InsertionBlocked);
        }
        while self.size + needed > self.capacity {
            match self.entries.front() {
                Some(e) if e.refs == 0 => {
                    let e = self.entries.pop_front().unwrap();
                    self.size -= e.field.mem_size();
                    self.dropped += 1;
                }
                _ => return Err(InsertionBlocked),
            }
        }
        self.size += needed;
        let index = self.dropped + self.entries.len() as u64;
        self.entries.push_back(Entry { field, refs: 0 });
        Ok(index)
    }

    pub fn duplicate(&mut self, absolute: u64) -> Result<u64, InsertionBlocked> {
        let field = self.get(absolute).ok_or(InsertionBlocked)?.clone();
        self.insert(field)
    }

    pub fn get(&self, absolute: u64) -> Option<&HeaderField> {
        if absolute < self.dropped {
            return None;
        }
        self.entries.get((absolute - self.dropped) as usize).map(|e| &e.field)
    }

    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<(u64, bool)> {
        let mut name_match = None;
        for (i, e) in self.entries.iter().enumerate() {
            if e.field.name == name {
                if e.field.value == value {
                    return Some((self.dropped + i as u64, true));
                }
                if name_match.is_none() {
                    name_match = Some(self.dropped + i as u64);
                }
            }
        }
        name_match.map(|idx| (idx, false))
    }

    pub fn add_ref(&mut self, absolute: u64) {
        if absolute < self.dropped {
            return;
        }
        if let Some(e) = self.entries.get_mut((absolute - self.dropped) as usize) {
            e.refs += 1;
        }
    }

    pub fn remove_ref(&mut self, absolute: u64) {
        if absolute < self.dropped {
            return;
        }
        if let Some(e) = self.entries.get_mut((absolute - self.dropped) as usize) {
            e.refs = e.refs.saturating_sub(1);
        }
    }
}

impl Default for DynamicTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut table = DynamicTable::new();
        table.set_capacity(4096).unwrap();
        let idx = table.insert(HeaderField::new("x-custom", "value")).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(table.get(0).unwrap().name, "x-custom");
        assert_eq!(table.insert_count(), 1);
    }

    #[test]
    fn eviction_respects_outstanding_refs() {
        let mut table = DynamicTable::new();
        table.set_capacity(HeaderField::new("a", "1").mem_size()).unwrap();
        let idx = table.insert(HeaderField::new("a", "1")).unwrap();
        table.add_ref(idx);
        // no room for a second entry while the first is referenced
        assert_eq!(table.insert(HeaderField::new("b", "2")), Err(InsertionBlocked));
        table.remove_ref(idx);
        assert!(table.insert(HeaderField::new("b", "2")).is_ok());
    }

    #[test]
    fn find_prefers_exact_value_match() {
        let mut table = DynamicTable::new();
        table.set_capacity(8192).unwrap();
        table.insert(HeaderField::new("x-a", "1")).unwrap();
        table.insert(HeaderField::new("x-a", "2")).unwrap();
        assert_eq!(table.find(b"x-a", b"2"), Some((1, true)));
        assert_eq!(table.find(b"x-a", b"9"), Some((0, false)));
    }
}
