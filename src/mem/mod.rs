// Copyright 2024 The silt Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::db::format::{
    InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType, INTERNAL_KEY_TAIL,
};
use crate::iterator::Iterator;
use crate::util::comparator::Comparator;
use crate::{Error, Result};
use crossbeam_skiplist::SkipMap;
use std::cmp::Ordering as CmpOrdering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// A skip map key holding an encoded internal key, ordered by the
// internal key comparator.
struct TableKey<C: Comparator> {
    cmp: InternalKeyComparator<C>,
    data: Vec<u8>,
}

impl<C: Comparator> TableKey<C> {
    fn new(cmp: InternalKeyComparator<C>, data: Vec<u8>) -> Self {
        Self { cmp, data }
    }
}

impl<C: Comparator> PartialEq for TableKey<C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp.compare(&self.data, &other.data) == CmpOrdering::Equal
    }
}

impl<C: Comparator> Eq for TableKey<C> {}

impl<C: Comparator> PartialOrd for TableKey<C> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp.compare(&self.data, &other.data))
    }
}

impl<C: Comparator> Ord for TableKey<C> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.cmp.compare(&self.data, &other.data)
    }
}

/// An in-memory write buffer over a lock-free skip list.
///
/// Entries are keyed by internal key, so all versions of a user key
/// coexist, newest first. `add` may be called concurrently from many
/// writer threads; readers never block.
pub struct MemTable<C: Comparator> {
    cmp: InternalKeyComparator<C>,
    table: Arc<SkipMap<TableKey<C>, Vec<u8>>>,
    mem_usage: AtomicUsize,
}

impl<C: Comparator + 'static> MemTable<C> {
    pub fn new(cmp: InternalKeyComparator<C>) -> Self {
        Self {
            cmp,
            table: Arc::new(SkipMap::new()),
            mem_usage: AtomicUsize::new(0),
        }
    }

    /// An estimate of the bytes held by this memtable.
    pub fn approximate_memory_usage(&self) -> usize {
        self.mem_usage.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Inserts an entry under `(key, seq, v_type)`. For deletions the
    /// value is empty.
    pub fn add(&self, seq: u64, v_type: ValueType, key: &[u8], value: &[u8]) {
        let mut ikey = Vec::with_capacity(key.len() + INTERNAL_KEY_TAIL);
        ikey.extend_from_slice(key);
        crate::util::coding::put_fixed_64(
            &mut ikey,
            crate::db::format::pack_seq_and_type(seq, v_type),
        );
        let charge = ikey.len() + value.len();
        self.table
            .insert(TableKey::new(self.cmp.clone(), ikey), value.to_vec());
        self.mem_usage.fetch_add(charge, Ordering::AcqRel);
    }

    /// Looks up the newest entry for the lookup key's user key visible
    /// at its sequence.
    ///
    /// Returns `None` if this memtable holds nothing for the user key,
    /// `Some(Ok(value))` for a live value and `Some(Err(NotFound))`
    /// when the newest visible entry is a deletion tombstone.
    pub fn get(&self, key: &LookupKey) -> Option<Result<Vec<u8>>> {
        let probe = TableKey::new(self.cmp.clone(), key.internal_key().to_vec());
        let entry = self
            .table
            .range((Bound::Included(&probe), Bound::Unbounded))
            .next()?;
        let parsed = ParsedInternalKey::decode_from(&entry.key().data)?;
        if self
            .cmp
            .user_comparator
            .compare(parsed.user_key, key.user_key())
            != CmpOrdering::Equal
        {
            return None;
        }
        match parsed.value_type {
            ValueType::Value => Some(Ok(entry.value().clone())),
            ValueType::Deletion => Some(Err(Error::NotFound(None))),
            ValueType::Unknown => None,
        }
    }

    /// An iterator over the internal keys and values of this memtable.
    pub fn iter(&self) -> MemTableIterator<C> {
        MemTableIterator {
            cmp: self.cmp.clone(),
            table: self.table.clone(),
            current: None,
        }
    }
}

/// Iterates a `MemTable` by repositioning through range queries, so it
/// stays valid while writers keep inserting concurrently.
pub struct MemTableIterator<C: Comparator> {
    cmp: InternalKeyComparator<C>,
    table: Arc<SkipMap<TableKey<C>, Vec<u8>>>,
    // copies of the current entry
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl<C: Comparator + 'static> MemTableIterator<C> {
    fn probe(&self, ikey: &[u8]) -> TableKey<C> {
        TableKey::new(self.cmp.clone(), ikey.to_vec())
    }

    // associated so callers can hold a borrow of `table` while
    // assigning the copy into `current`
    fn copy_entry<'g>(
        entry: Option<crossbeam_skiplist::map::Entry<'g, TableKey<C>, Vec<u8>>>,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        entry.map(|e| (e.key().data.clone(), e.value().clone()))
    }
}

impl<C: Comparator + 'static> Iterator for MemTableIterator<C> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.current = Self::copy_entry(self.table.front());
    }

    fn seek_to_last(&mut self) {
        self.current = Self::copy_entry(self.table.back());
    }

    fn seek(&mut self, target: &[u8]) {
        let probe = self.probe(target);
        self.current = Self::copy_entry(
            self.table
                .range((Bound::Included(&probe), Bound::Unbounded))
                .next(),
        );
    }

    fn next(&mut self) {
        let key = self.current.as_ref().expect("invalid iterator").0.clone();
        let probe = self.probe(&key);
        self.current = Self::copy_entry(
            self.table
                .range((Bound::Excluded(&probe), Bound::Unbounded))
                .next(),
        );
    }

    fn prev(&mut self) {
        let key = self.current.as_ref().expect("invalid iterator").0.clone();
        let probe = self.probe(&key);
        self.current = Self::copy_entry(
            self.table
                .range((Bound::Unbounded, Bound::Excluded(&probe)))
                .next_back(),
        );
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("invalid iterator").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("invalid iterator").1
    }

    fn status(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format::extract_user_key;
    use crate::util::comparator::BytewiseComparator;

    fn new_mem() -> MemTable<BytewiseComparator> {
        MemTable::new(InternalKeyComparator::new(BytewiseComparator))
    }

    #[test]
    fn test_add_and_get() {
        let mem = new_mem();
        mem.add(1, ValueType::Value, b"foo", b"v1");
        mem.add(2, ValueType::Value, b"bar", b"v2");
        mem.add(3, ValueType::Value, b"foo", b"v3");

        // newest visible version wins
        let got = mem.get(&LookupKey::new(b"foo", 10)).unwrap().unwrap();
        assert_eq!(got, b"v3");
        // sequence caps visibility
        let got = mem.get(&LookupKey::new(b"foo", 1)).unwrap().unwrap();
        assert_eq!(got, b"v1");
        // nothing visible before the first write
        assert!(mem.get(&LookupKey::new(b"bar", 1)).is_none());
        assert!(mem.get(&LookupKey::new(b"missing", 10)).is_none());
    }

    #[test]
    fn test_deletion_tombstone() {
        let mem = new_mem();
        mem.add(1, ValueType::Value, b"foo", b"v1");
        mem.add(2, ValueType::Deletion, b"foo", b"");
        match mem.get(&LookupKey::new(b"foo", 10)) {
            Some(Err(Error::NotFound(_))) => {}
            other => panic!("expected tombstone, got {:?}", other.map(|r| r.is_ok())),
        }
        // older read still sees the value
        let got = mem.get(&LookupKey::new(b"foo", 1)).unwrap().unwrap();
        assert_eq!(got, b"v1");
    }

    #[test]
    fn test_memory_usage_grows() {
        let mem = new_mem();
        assert_eq!(mem.approximate_memory_usage(), 0);
        mem.add(1, ValueType::Value, b"key", b"value");
        assert!(mem.approximate_memory_usage() >= 3 + 5 + INTERNAL_KEY_TAIL);
    }

    #[test]
    fn test_iterator_orders_internal_keys() {
        let mem = new_mem();
        mem.add(3, ValueType::Value, b"a", b"a3");
        mem.add(1, ValueType::Value, b"a", b"a1");
        mem.add(2, ValueType::Value, b"b", b"b2");
        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut seen = vec![];
        while iter.valid() {
            let parsed = ParsedInternalKey::decode_from(iter.key()).unwrap();
            seen.push((parsed.user_key.to_vec(), parsed.seq));
            iter.next();
        }
        // user key ascending, sequence descending within a user key
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 3),
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 2)
            ]
        );
    }

    #[test]
    fn test_iterator_seek_and_prev() {
        let mem = new_mem();
        mem.add(1, ValueType::Value, b"a", b"1");
        mem.add(2, ValueType::Value, b"c", b"2");
        mem.add(3, ValueType::Value, b"e", b"3");
        let mut iter = mem.iter();
        iter.seek(LookupKey::new(b"b", u64::MAX >> 8).internal_key());
        assert!(iter.valid());
        assert_eq!(extract_user_key(iter.key()), b"c");
        iter.prev();
        assert_eq!(extract_user_key(iter.key()), b"a");
        iter.prev();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert_eq!(extract_user_key(iter.key()), b"e");
    }

    #[test]
    fn test_concurrent_adds_visible() {
        use std::sync::Arc;
        let mem = Arc::new(new_mem());
        let mut handles = vec![];
        for t in 0..4u64 {
            let mem = mem.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    let seq = t * 100 + i + 1;
                    mem.add(
                        seq,
                        ValueType::Value,
                        format!("key-{:03}-{}", i, t).as_bytes(),
                        b"v",
                    );
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mem.len(), 400);
    }
}
