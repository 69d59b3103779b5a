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
    extract_user_key, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType,
};
use crate::db::DBImpl;
use crate::iterator::{Iterator, MergingIterator};
use crate::storage::Storage;
use crate::util::comparator::Comparator;
use crate::version::Version;
use crate::Result;
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

pub type SiltDBIterator<S, C> = DBIterator<MergingIterator<InternalKeyComparator<C>>, S, C>;
pub type SiltReplayIterator<C> = ReplayIterator<MergingIterator<InternalKeyComparator<C>>, C>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    // When moving forward, the inner iterator is positioned at the
    // exact entry yielding the current key and value.
    Forward,
    // When moving backward, the inner iterator is positioned before
    // every entry of the current user key, whose newest visible state
    // is held in `saved_key` / `saved_value`.
    Reverse,
}

/// An iterator over the live user keys of the db, collapsing the
/// multiple sequenced entries per key into the single newest state
/// visible at `sequence` and hiding deleted keys.
///
/// Holds the version it iterates pinned, so the table files underneath
/// survive concurrent compactions.
pub struct DBIterator<I: Iterator, S: Storage + Clone + 'static, C: Comparator + 'static> {
    valid: bool,
    inner: I,
    db: Arc<DBImpl<S, C>>,
    version: Arc<Version<C>>,
    ucmp: C,
    sequence: u64,
    direction: Direction,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    bytes_until_read_sampling: u64,
}

impl<I: Iterator, S: Storage + Clone + 'static, C: Comparator + 'static> DBIterator<I, S, C> {
    pub(crate) fn new(inner: I, db: Arc<DBImpl<S, C>>, sequence: u64, version: Arc<Version<C>>) -> Self {
        let ucmp = db.options.comparator.clone();
        let bytes_until_read_sampling = db.options.read_bytes_period;
        Self {
            valid: false,
            inner,
            db,
            version,
            ucmp,
            sequence,
            direction: Direction::Forward,
            saved_key: vec![],
            saved_value: vec![],
            bytes_until_read_sampling,
        }
    }

    /// Accounts the bytes just examined and occasionally feeds the key
    /// back as a seek sample, so read-heavy files get compacted.
    fn sample_read(&mut self, ikey: &[u8], value_len: usize) {
        let consumed = (ikey.len() + value_len) as u64;
        if self.bytes_until_read_sampling <= consumed {
            self.bytes_until_read_sampling = self.db.options.read_bytes_period;
            if self.version.record_read_sample(ikey) {
                self.db.trigger_compaction();
            }
        } else {
            self.bytes_until_read_sampling -= consumed;
        }
    }

    /// Advances to the first entry at or after the inner position that
    /// yields a visible, live user key. When `skipping`, entries whose
    /// user key is at or before `saved_key` are passed over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        while self.inner.valid() {
            let ikey = self.inner.key().to_vec();
            let value_len = self.inner.value().len();
            self.sample_read(&ikey, value_len);
            if let Some(parsed) = ParsedInternalKey::decode_from(&ikey) {
                if parsed.seq <= self.sequence {
                    match parsed.value_type {
                        ValueType::Deletion => {
                            // every older entry of this key is shadowed
                            self.saved_key = parsed.user_key.to_vec();
                            skipping = true;
                        }
                        ValueType::Value => {
                            if !(skipping
                                && self.ucmp.compare(parsed.user_key, &self.saved_key)
                                    != CmpOrdering::Greater)
                            {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                        ValueType::Unknown => {}
                    }
                }
            }
            self.inner.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Walks backwards collecting the newest visible state of the
    /// nearest preceding live user key into `saved_key`/`saved_value`,
    /// leaving the inner iterator before all of that key's entries.
    fn find_prev_user_entry(&mut self) {
        let mut value_type = ValueType::Deletion;
        while self.inner.valid() {
            let ikey = self.inner.key().to_vec();
            let value_len = self.inner.value().len();
            self.sample_read(&ikey, value_len);
            if let Some(parsed) = ParsedInternalKey::decode_from(&ikey) {
                if parsed.seq <= self.sequence {
                    if value_type != ValueType::Deletion
                        && self.ucmp.compare(parsed.user_key, &self.saved_key)
                            == CmpOrdering::Less
                    {
                        // crossed into an earlier user key; the saved
                        // state is the answer
                        break;
                    }
                    value_type = parsed.value_type;
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        self.saved_key = parsed.user_key.to_vec();
                        self.saved_value = self.inner.value().to_vec();
                    }
                }
            }
            self.inner.prev();
        }
        if value_type == ValueType::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl<I: Iterator, S: Storage + Clone + 'static, C: Comparator + 'static> Iterator
    for DBIterator<I, S, C>
{
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        let lookup = LookupKey::new(target, self.sequence);
        self.inner.seek(lookup.internal_key());
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn next(&mut self) {
        assert!(self.valid, "next on invalid iterator");
        match self.direction {
            Direction::Reverse => {
                self.direction = Direction::Forward;
                // the inner iterator sits before the entries of the
                // current key; step back onto them (or to the start)
                if self.inner.valid() {
                    self.inner.next();
                } else {
                    self.inner.seek_to_first();
                }
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    return;
                }
            }
            Direction::Forward => {
                self.saved_key = extract_user_key(self.inner.key()).to_vec();
                self.inner.next();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    return;
                }
            }
        }
        self.find_next_user_entry(true);
    }

    fn prev(&mut self) {
        assert!(self.valid, "prev on invalid iterator");
        if self.direction == Direction::Forward {
            // back the inner iterator off every entry of the current
            // user key before scanning for the previous one
            self.saved_key = extract_user_key(self.inner.key()).to_vec();
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .ucmp
                    .compare(extract_user_key(self.inner.key()), &self.saved_key)
                    == CmpOrdering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid, "key on invalid iterator");
        match self.direction {
            Direction::Forward => extract_user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid, "value on invalid iterator");
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    fn status(&mut self) -> Result<()> {
        self.inner.status()
    }
}

/// An iterator over every individual write sequenced at or after
/// `start_sequence`, in key order. Unlike `DBIterator` nothing is
/// collapsed: each surviving put and delete is yielded with its
/// sequence number, so a consumer can re-apply the suffix of history
/// elsewhere.
pub struct ReplayIterator<I: Iterator, C: Comparator + 'static> {
    inner: I,
    start_sequence: u64,
    // pins the table files backing `inner`
    _version: Arc<Version<C>>,
}

impl<I: Iterator, C: Comparator + 'static> ReplayIterator<I, C> {
    pub(crate) fn new(mut inner: I, start_sequence: u64, version: Arc<Version<C>>) -> Self {
        inner.seek_to_first();
        let mut iter = Self {
            inner,
            start_sequence,
            _version: version,
        };
        iter.skip_old_entries();
        iter
    }

    fn skip_old_entries(&mut self) {
        while self.inner.valid() {
            if let Some(parsed) = ParsedInternalKey::decode_from(self.inner.key()) {
                if parsed.seq >= self.start_sequence {
                    return;
                }
            }
            self.inner.next();
        }
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn next(&mut self) {
        self.inner.next();
        self.skip_old_entries();
    }

    /// The user key of the current write.
    pub fn key(&self) -> &[u8] {
        extract_user_key(self.inner.key())
    }

    /// The value of the current write. Meaningless when `has_value` is
    /// false.
    pub fn value(&self) -> &[u8] {
        self.inner.value()
    }

    /// The sequence number the current write was assigned.
    pub fn sequence(&self) -> u64 {
        ParsedInternalKey::decode_from(self.inner.key()).map_or(0, |parsed| parsed.seq)
    }

    /// True for a put, false for a delete.
    pub fn has_value(&self) -> bool {
        ParsedInternalKey::decode_from(self.inner.key())
            .map_or(false, |parsed| parsed.value_type == ValueType::Value)
    }

    pub fn status(&mut self) -> Result<()> {
        self.inner.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format::InternalKeyComparator;
    use crate::iterator::MergingIterator;
    use crate::mem::MemTable;
    use crate::options::Options;
    use crate::util::comparator::BytewiseComparator;

    fn replay_fixture() -> (
        MergingIterator<InternalKeyComparator<BytewiseComparator>>,
        Arc<Version<BytewiseComparator>>,
    ) {
        let icmp = InternalKeyComparator::new(BytewiseComparator::default());
        let mem = MemTable::new(icmp.clone());
        mem.add(1, ValueType::Value, b"a", b"1");
        mem.add(2, ValueType::Value, b"b", b"2");
        mem.add(3, ValueType::Value, b"c", b"3");
        mem.add(4, ValueType::Deletion, b"a", b"");
        let options = Arc::new(Options::<BytewiseComparator>::default());
        let version = Arc::new(Version::new(options, icmp.clone()));
        let merged = MergingIterator::new(icmp, vec![Box::new(mem.iter()) as Box<dyn Iterator>]);
        (merged, version)
    }

    #[test]
    fn test_replay_iterator_yields_the_suffix_in_key_order() {
        let (merged, version) = replay_fixture();
        let mut iter = ReplayIterator::new(merged, 3, version);
        assert!(iter.valid());
        assert_eq!(iter.key(), b"a");
        assert_eq!(iter.sequence(), 4);
        assert!(!iter.has_value());
        iter.next();
        assert!(iter.valid());
        assert_eq!(iter.key(), b"c");
        assert_eq!(iter.sequence(), 3);
        assert!(iter.has_value());
        assert_eq!(iter.value(), b"3");
        iter.next();
        assert!(!iter.valid());
        iter.status().unwrap();
    }

    #[test]
    fn test_replay_iterator_from_the_beginning_keeps_every_write() {
        let (merged, version) = replay_fixture();
        let mut iter = ReplayIterator::new(merged, 0, version);
        let mut seen = vec![];
        while iter.valid() {
            seen.push((iter.key().to_vec(), iter.sequence(), iter.has_value()));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 4, false),
                (b"a".to_vec(), 1, true),
                (b"b".to_vec(), 2, true),
                (b"c".to_vec(), 3, true),
            ]
        );
    }

    #[test]
    fn test_replay_iterator_past_the_end_is_empty() {
        let (merged, version) = replay_fixture();
        let iter = ReplayIterator::new(merged, 100, version);
        assert!(!iter.valid());
    }
}
