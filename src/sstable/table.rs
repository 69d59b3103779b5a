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

use crate::iterator::Iterator;
use crate::sstable::{Footer, FOOTER_SIZE, INDEX_SEGMENT_SIZE};
use crate::storage::File;
use crate::util::coding::{decode_fixed_64, put_fixed_64};
use crate::util::comparator::Comparator;
use crate::util::crc32;
use crate::util::varint::VarintU32;
use crate::{Error, Result};
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

/// Builds a table file from entries added in sorted order.
///
/// The run is buffered in memory and written out by `finish`; table
/// files are bounded by `max_file_size`, so the buffer stays small.
pub struct TableBuilder<F: File, C: Comparator> {
    file: F,
    cmp: C,
    buf: Vec<u8>,
    index: Vec<u8>,
    num_entries: usize,
    // entries in the current index segment
    counter: usize,
    segment_start: u64,
    last_key: Vec<u8>,
    pending_index_entry: bool,
    closed: bool,
}

impl<F: File, C: Comparator> TableBuilder<F, C> {
    pub fn new(file: F, cmp: C) -> Self {
        Self {
            file,
            cmp,
            buf: vec![],
            index: vec![],
            num_entries: 0,
            counter: 0,
            segment_start: 0,
            last_key: vec![],
            pending_index_entry: false,
            closed: false,
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.closed, "add called on a finished TableBuilder");
        if self.num_entries > 0
            && self.cmp.compare(key, &self.last_key) != CmpOrdering::Greater
        {
            return Err(Error::InvalidArgument(format!(
                "keys must be added in strictly increasing order, got {:?} after {:?}",
                key, self.last_key
            )));
        }
        if self.pending_index_entry {
            // close out the previous segment with a key separating it
            // from this one
            let sep = self.cmp.separator(&self.last_key, key);
            VarintU32::put_varint_prefixed_slice(&mut self.index, &sep);
            put_fixed_64(&mut self.index, self.segment_start);
            self.segment_start = self.buf.len() as u64;
            self.pending_index_entry = false;
        }
        VarintU32::put_varint_prefixed_slice(&mut self.buf, key);
        VarintU32::put_varint_prefixed_slice(&mut self.buf, value);
        self.last_key = key.to_vec();
        self.num_entries += 1;
        self.counter += 1;
        if self.counter >= INDEX_SEGMENT_SIZE {
            self.counter = 0;
            self.pending_index_entry = true;
        }
        Ok(())
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// The size the finished file will have (or has, once finished).
    pub fn file_size(&self) -> u64 {
        (self.buf.len() + self.index.len() + FOOTER_SIZE) as u64
    }

    /// Writes the buffered run, its index and the footer to the file.
    pub fn finish(&mut self, sync: bool) -> Result<()> {
        assert!(!self.closed, "finish called twice on a TableBuilder");
        self.closed = true;
        if self.num_entries > 0 {
            // tail segment: any key at or after the last one will do
            let suc = self.cmp.successor(&self.last_key);
            VarintU32::put_varint_prefixed_slice(&mut self.index, &suc);
            put_fixed_64(&mut self.index, self.segment_start);
        }
        let footer = Footer {
            index_offset: self.buf.len() as u64,
            checksum: crc32::hash2(&self.buf, &self.index),
        };
        let mut tail = vec![];
        footer.encode(&mut tail);
        self.file.write(&self.buf)?;
        self.file.write(&self.index)?;
        self.file.write(&tail)?;
        self.file.flush()?;
        if sync {
            self.file.sync()?;
        }
        self.file.close()
    }
}

// a parsed entry: spans into `Table::data`
#[derive(Clone, Copy)]
struct EntrySpan {
    key_start: usize,
    key_len: usize,
    val_start: usize,
    val_len: usize,
}

/// An open, immutable table file.
///
/// The whole run is kept in memory; total residency is bounded by the
/// table cache.
pub struct Table {
    data: Vec<u8>,
    entries: Vec<EntrySpan>,
    index: Vec<(Vec<u8>, u64)>,
    data_size: u64,
}

impl Table {
    /// Reads and parses a table file.
    pub fn open<F: File>(file: &F, file_size: u64, verify_checksum: bool) -> Result<Self> {
        if (file_size as usize) < FOOTER_SIZE {
            return Err(Error::Corruption(
                "file is too short to be an sstable".to_owned(),
            ));
        }
        let mut footer_buf = vec![0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer_buf, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode_from(&footer_buf)?;
        if footer.index_offset > file_size - FOOTER_SIZE as u64 {
            return Err(Error::Corruption("index offset out of range".to_owned()));
        }
        let mut contents = vec![0u8; (file_size as usize) - FOOTER_SIZE];
        file.read_exact_at(&mut contents, 0)?;
        if verify_checksum && crc32::hash(&contents) != footer.checksum {
            return Err(Error::Corruption("table checksum mismatch".to_owned()));
        }
        let index_raw = contents.split_off(footer.index_offset as usize);
        let data = contents;

        let mut entries = vec![];
        let mut pos = 0usize;
        let corrupted = || Error::Corruption("bad table entry".to_owned());
        while pos < data.len() {
            let (key_len, n) = VarintU32::read(&data[pos..]).ok_or_else(corrupted)?;
            let key_start = pos + n;
            pos = key_start + key_len as usize;
            if pos > data.len() {
                return Err(corrupted());
            }
            let (val_len, n) = VarintU32::read(&data[pos..]).ok_or_else(corrupted)?;
            let val_start = pos + n;
            pos = val_start + val_len as usize;
            if pos > data.len() {
                return Err(corrupted());
            }
            entries.push(EntrySpan {
                key_start,
                key_len: key_len as usize,
                val_start,
                val_len: val_len as usize,
            });
        }

        let mut index = vec![];
        let mut src = index_raw.as_slice();
        while !src.is_empty() {
            let key = VarintU32::get_varint_prefixed_slice(&mut src)
                .ok_or_else(|| Error::Corruption("bad table index entry".to_owned()))?;
            if src.len() < 8 {
                return Err(Error::Corruption("bad table index entry".to_owned()));
            }
            let offset = decode_fixed_64(src);
            src = &src[8..];
            index.push((key.to_vec(), offset));
        }

        let data_size = data.len() as u64;
        Ok(Self {
            data,
            entries,
            index,
            data_size,
        })
    }

    fn key(&self, i: usize) -> &[u8] {
        let e = &self.entries[i];
        &self.data[e.key_start..e.key_start + e.key_len]
    }

    fn value(&self, i: usize) -> &[u8] {
        let e = &self.entries[i];
        &self.data[e.val_start..e.val_start + e.val_len]
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    // index of the first entry with key >= target
    fn lower_bound<C: Comparator>(&self, cmp: &C, target: &[u8]) -> usize {
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(self.key(mid), target) == CmpOrdering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Finds the first entry at or past `ikey`. Returns the entry's
    /// key and value.
    pub fn get<C: Comparator>(&self, cmp: &C, ikey: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let i = self.lower_bound(cmp, ikey);
        if i < self.entries.len() {
            Some((self.key(i).to_vec(), self.value(i).to_vec()))
        } else {
            None
        }
    }

    /// An estimate of the file offset where `ikey` would live, from
    /// the sparse index.
    pub fn approximate_offset_of<C: Comparator>(&self, cmp: &C, ikey: &[u8]) -> u64 {
        let pos = self
            .index
            .partition_point(|(k, _)| cmp.compare(k, ikey) == CmpOrdering::Less);
        match self.index.get(pos) {
            Some((_, offset)) => *offset,
            None => self.data_size,
        }
    }
}

/// Iterates an open table.
pub struct TableIterator<C: Comparator> {
    cmp: C,
    table: Arc<Table>,
    // entries.len() means "invalid"
    idx: usize,
}

impl<C: Comparator> TableIterator<C> {
    pub fn new(cmp: C, table: Arc<Table>) -> Self {
        let idx = table.entries.len();
        Self { cmp, table, idx }
    }
}

impl<C: Comparator> Iterator for TableIterator<C> {
    fn valid(&self) -> bool {
        self.idx < self.table.entries.len()
    }

    fn seek_to_first(&mut self) {
        self.idx = 0;
    }

    fn seek_to_last(&mut self) {
        self.idx = if self.table.entries.is_empty() {
            0
        } else {
            self.table.entries.len() - 1
        };
    }

    fn seek(&mut self, target: &[u8]) {
        self.idx = self.table.lower_bound(&self.cmp, target);
    }

    fn next(&mut self) {
        assert!(self.valid(), "invalid iterator");
        self.idx += 1;
    }

    fn prev(&mut self) {
        assert!(self.valid(), "invalid iterator");
        self.idx = match self.idx {
            0 => self.table.entries.len(),
            i => i - 1,
        };
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid(), "invalid iterator");
        self.table.key(self.idx)
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid(), "invalid iterator");
        self.table.value(self.idx)
    }

    fn status(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mem::MemStorage;
    use crate::storage::Storage;
    use crate::util::comparator::BytewiseComparator;

    fn build_table(entries: &[(&[u8], &[u8])]) -> (MemStorage, u64) {
        let env = MemStorage::default();
        let mut builder = TableBuilder::new(env.create("t.sst").unwrap(), BytewiseComparator);
        for (k, v) in entries {
            builder.add(k, v).unwrap();
        }
        builder.finish(true).unwrap();
        let size = env.open("t.sst").unwrap().len().unwrap();
        (env, size)
    }

    fn open_table(env: &MemStorage, size: u64) -> Arc<Table> {
        Arc::new(Table::open(&env.open("t.sst").unwrap(), size, true).unwrap())
    }

    #[test]
    fn test_build_and_read_back() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                (
                    format!("key-{:04}", i).into_bytes(),
                    format!("value-{}", i).into_bytes(),
                )
            })
            .collect();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let (env, size) = build_table(&refs);
        let table = open_table(&env, size);
        assert_eq!(table.num_entries(), 100);
        let mut iter = TableIterator::new(BytewiseComparator, table.clone());
        iter.seek_to_first();
        for (k, v) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            assert_eq!(iter.value(), v.as_slice());
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_get_lower_bound_semantics() {
        let (env, size) = build_table(&[(b"b", b"2"), (b"d", b"4"), (b"f", b"6")]);
        let table = open_table(&env, size);
        let c = BytewiseComparator;
        assert_eq!(table.get(&c, b"a").unwrap().0, b"b");
        assert_eq!(table.get(&c, b"d").unwrap().0, b"d");
        assert_eq!(table.get(&c, b"e").unwrap().1, b"6");
        assert!(table.get(&c, b"g").is_none());
    }

    #[test]
    fn test_seek_and_prev() {
        let (env, size) = build_table(&[(b"a", b"1"), (b"c", b"3"), (b"e", b"5")]);
        let table = open_table(&env, size);
        let mut iter = TableIterator::new(BytewiseComparator, table);
        iter.seek(b"b");
        assert_eq!(iter.key(), b"c");
        iter.prev();
        assert_eq!(iter.key(), b"a");
        iter.prev();
        assert!(!iter.valid());
        iter.seek(b"z");
        assert!(!iter.valid());
        iter.seek_to_last();
        assert_eq!(iter.key(), b"e");
    }

    #[test]
    fn test_rejects_out_of_order_adds() {
        let env = MemStorage::default();
        let mut builder = TableBuilder::new(env.create("t.sst").unwrap(), BytewiseComparator);
        builder.add(b"b", b"1").unwrap();
        assert!(builder.add(b"a", b"2").is_err());
        assert!(builder.add(b"b", b"3").is_err());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let (env, size) = build_table(&[(b"a", b"1"), (b"b", b"2")]);
        let mut raw = vec![];
        env.open("t.sst").unwrap().read_all(&mut raw).unwrap();
        raw[2] ^= 0xff;
        let mut f = env.create("t.sst").unwrap();
        f.write(&raw).unwrap();
        let file = env.open("t.sst").unwrap();
        assert!(Table::open(&file, size, true).is_err());
    }

    #[test]
    fn test_approximate_offsets_monotonic() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..200)
            .map(|i| (format!("k{:05}", i).into_bytes(), vec![b'v'; 100]))
            .collect();
        let refs: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let (env, size) = build_table(&refs);
        let table = open_table(&env, size);
        let c = BytewiseComparator;
        let early = table.approximate_offset_of(&c, b"k00010");
        let late = table.approximate_offset_of(&c, b"k00190");
        let past = table.approximate_offset_of(&c, b"z");
        assert!(early < late);
        assert!(late <= past);
        assert_eq!(past, table.data_size);
        assert!(past <= size);
    }

    #[test]
    fn test_empty_table() {
        let (env, size) = build_table(&[]);
        let table = open_table(&env, size);
        assert_eq!(table.num_entries(), 0);
        let mut iter = TableIterator::new(BytewiseComparator, table);
        iter.seek_to_first();
        assert!(!iter.valid());
    }
}
