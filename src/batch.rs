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

// Copyright (c) 2011 The LevelDB Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::db::format::ValueType;
use crate::mem::MemTable;
use crate::util::coding::{decode_fixed_32, decode_fixed_64, encode_fixed_32, encode_fixed_64};
use crate::util::comparator::Comparator;
use crate::util::varint::VarintU32;
use crate::{Error, Result};

// WriteBatch header: an 8 byte sequence number followed by a 4 byte
// entry count.
pub(crate) const HEADER_SIZE: usize = 12;

/// A collection of updates applied atomically, in order.
///
/// Wire format (also the WAL record payload):
///
/// ```text
///   sequence: fixed64
///   count:    fixed32
///   entry*:   type(1) | varint32 klen | key | [varint32 vlen | value]
/// ```
#[derive(Clone)]
pub struct WriteBatch {
    contents: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self {
            contents: vec![0; HEADER_SIZE],
        }
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a `key -> value` mapping.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.get_count() + 1);
        self.contents.push(ValueType::Value as u8);
        VarintU32::put_varint_prefixed_slice(&mut self.contents, key);
        VarintU32::put_varint_prefixed_slice(&mut self.contents, value);
    }

    /// Queues a deletion of `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.get_count() + 1);
        self.contents.push(ValueType::Deletion as u8);
        VarintU32::put_varint_prefixed_slice(&mut self.contents, key);
    }

    /// Appends all updates in `src` after this batch's own.
    pub fn append(&mut self, src: &WriteBatch) {
        assert!(src.contents.len() >= HEADER_SIZE);
        self.set_count(self.get_count() + src.get_count());
        self.contents.extend_from_slice(&src.contents[HEADER_SIZE..]);
    }

    /// Drops all queued updates.
    pub fn clear(&mut self) {
        self.contents.clear();
        self.contents.resize(HEADER_SIZE, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.get_count() == 0
    }

    /// The serialized size of this batch.
    pub fn approximate_size(&self) -> usize {
        self.contents.len()
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.contents
    }

    /// Replaces the whole batch with already-serialized contents, e.g.
    /// a WAL record read back during recovery.
    pub(crate) fn set_contents(&mut self, data: Vec<u8>) -> Result<()> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Corruption("WriteBatch is too small".to_owned()));
        }
        self.contents = data;
        Ok(())
    }

    pub(crate) fn get_count(&self) -> u32 {
        decode_fixed_32(&self.contents[8..HEADER_SIZE])
    }

    fn set_count(&mut self, count: u32) {
        encode_fixed_32(&mut self.contents[8..HEADER_SIZE], count);
    }

    pub(crate) fn get_sequence(&self) -> u64 {
        decode_fixed_64(&self.contents)
    }

    pub(crate) fn set_sequence(&mut self, seq: u64) {
        encode_fixed_64(&mut self.contents, seq);
    }

    /// Applies every update to `mem`, numbering the entries from the
    /// batch's sequence.
    pub(crate) fn insert_into<C: Comparator + 'static>(&self, mem: &MemTable<C>) -> Result<()> {
        let mut seq = self.get_sequence();
        let mut found = 0;
        let mut src = &self.contents[HEADER_SIZE..];
        while !src.is_empty() {
            let tag = src[0];
            src = &src[1..];
            match ValueType::from(tag as u64) {
                ValueType::Value => {
                    let key = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| Error::Corruption("bad WriteBatch put".to_owned()))?;
                    let value = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| Error::Corruption("bad WriteBatch put".to_owned()))?;
                    mem.add(seq, ValueType::Value, key, value);
                }
                ValueType::Deletion => {
                    let key = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| Error::Corruption("bad WriteBatch delete".to_owned()))?;
                    mem.add(seq, ValueType::Deletion, key, b"");
                }
                ValueType::Unknown => {
                    return Err(Error::Corruption("unknown WriteBatch tag".to_owned()))
                }
            }
            seq += 1;
            found += 1;
        }
        if found != self.get_count() {
            return Err(Error::Corruption(
                "WriteBatch has wrong count".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format::{InternalKeyComparator, LookupKey, ParsedInternalKey};
    use crate::iterator::Iterator;
    use crate::util::comparator::BytewiseComparator;

    fn new_mem() -> MemTable<BytewiseComparator> {
        MemTable::new(InternalKeyComparator::new(BytewiseComparator))
    }

    fn contents_of(mem: &MemTable<BytewiseComparator>) -> Vec<(Vec<u8>, u64, ValueType, Vec<u8>)> {
        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut res = vec![];
        while iter.valid() {
            let p = ParsedInternalKey::decode_from(iter.key()).unwrap();
            res.push((
                p.user_key.to_vec(),
                p.seq,
                p.value_type,
                iter.value().to_vec(),
            ));
            iter.next();
        }
        res
    }

    #[test]
    fn test_empty_batch() {
        let b = WriteBatch::new();
        assert!(b.is_empty());
        assert_eq!(b.get_count(), 0);
        assert_eq!(b.approximate_size(), HEADER_SIZE);
    }

    #[test]
    fn test_put_delete_insert_into() {
        let mut b = WriteBatch::new();
        b.put(b"foo", b"bar");
        b.delete(b"box");
        b.put(b"baz", b"boo");
        b.set_sequence(100);
        assert_eq!(b.get_count(), 3);

        let mem = new_mem();
        b.insert_into(&mem).unwrap();
        assert_eq!(
            contents_of(&mem),
            vec![
                (b"baz".to_vec(), 102, ValueType::Value, b"boo".to_vec()),
                (b"box".to_vec(), 101, ValueType::Deletion, b"".to_vec()),
                (b"foo".to_vec(), 100, ValueType::Value, b"bar".to_vec()),
            ]
        );
        // the tombstone shadows nothing here but still reports NotFound
        assert!(mem.get(&LookupKey::new(b"box", 200)).unwrap().is_err());
    }

    #[test]
    fn test_append() {
        let mut b1 = WriteBatch::new();
        b1.put(b"a", b"1");
        let mut b2 = WriteBatch::new();
        b2.put(b"b", b"2");
        b2.delete(b"a");
        b1.append(&b2);
        assert_eq!(b1.get_count(), 3);
        b1.set_sequence(1);
        let mem = new_mem();
        b1.insert_into(&mem).unwrap();
        assert_eq!(contents_of(&mem).len(), 3);
        // the delete sequenced after the put wins
        assert!(mem.get(&LookupKey::new(b"a", 10)).unwrap().is_err());
    }

    #[test]
    fn test_round_trip_through_contents() {
        let mut b = WriteBatch::new();
        b.put(b"k1", b"v1");
        b.delete(b"k2");
        b.set_sequence(7);
        let mut copy = WriteBatch::new();
        copy.set_contents(b.data().to_vec()).unwrap();
        assert_eq!(copy.get_count(), 2);
        assert_eq!(copy.get_sequence(), 7);
    }

    #[test]
    fn test_corrupted_contents_rejected() {
        let mut b = WriteBatch::new();
        assert!(b.set_contents(vec![0; 3]).is_err());
        // truncated entry
        let mut data = vec![0; HEADER_SIZE];
        encode_fixed_32(&mut data[8..], 1);
        data.push(ValueType::Value as u8);
        data.push(200); // varint key length with no key bytes
        b.set_contents(data).unwrap();
        let mem = new_mem();
        assert!(b.insert_into(&mem).is_err());
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let mut b = WriteBatch::new();
        b.put(b"a", b"1");
        let mut data = b.data().to_vec();
        encode_fixed_32(&mut data[8..], 9);
        let mut c = WriteBatch::new();
        c.set_contents(data).unwrap();
        let mem = new_mem();
        assert!(c.insert_into(&mem).is_err());
    }

    #[test]
    fn test_clear() {
        let mut b = WriteBatch::new();
        b.put(b"a", b"1");
        b.set_sequence(5);
        b.clear();
        assert!(b.is_empty());
        assert_eq!(b.get_sequence(), 0);
    }
}
