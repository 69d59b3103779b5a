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

use crate::util::comparator::Comparator;
use crate::{Error, Result};
use std::cmp::Ordering;

/// A common trait for iterating all the key/value entries of a table,
/// a memtable or a whole db.
///
/// An iterator is initially invalid; the caller must call one of the
/// seek methods before `key`, `value`, `next` or `prev`.
pub trait Iterator {
    /// An iterator is either positioned at a key/value pair or not
    /// valid.
    fn valid(&self) -> bool;

    /// Positions at the first entry of the source.
    fn seek_to_first(&mut self);

    /// Positions at the last entry of the source.
    fn seek_to_last(&mut self);

    /// Positions at the first entry with a key at or past `target`.
    fn seek(&mut self, target: &[u8]);

    /// Moves to the next entry.
    ///
    /// # Panics
    ///
    /// Panics if the iterator is not valid.
    fn next(&mut self);

    /// Moves to the previous entry.
    ///
    /// # Panics
    ///
    /// Panics if the iterator is not valid.
    fn prev(&mut self);

    /// The key of the current entry.
    ///
    /// # Panics
    ///
    /// Panics if the iterator is not valid.
    fn key(&self) -> &[u8];

    /// The value of the current entry.
    ///
    /// # Panics
    ///
    /// Panics if the iterator is not valid.
    fn value(&self) -> &[u8];

    /// The first error this iterator has encountered, if any.
    fn status(&mut self) -> Result<()>;
}

/// An iterator over nothing, optionally carrying an error.
pub struct EmptyIterator {
    err: Option<Error>,
}

impl EmptyIterator {
    pub fn new() -> Self {
        Self { err: None }
    }

    pub fn new_with_err(err: Error) -> Self {
        Self { err: Some(err) }
    }
}

impl Default for EmptyIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for EmptyIterator {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {
        unreachable!("invalid iterator")
    }
    fn prev(&mut self) {
        unreachable!("invalid iterator")
    }
    fn key(&self) -> &[u8] {
        unreachable!("invalid iterator")
    }
    fn value(&self) -> &[u8] {
        unreachable!("invalid iterator")
    }
    fn status(&mut self) -> Result<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges the entries of several sorted children into one sorted
/// stream. Entries with equal keys surface in child order, so callers
/// should put newer sources first.
pub struct MergingIterator<C: Comparator> {
    cmp: C,
    children: Vec<Box<dyn Iterator>>,
    current: Option<usize>,
    direction: Direction,
}

impl<C: Comparator> MergingIterator<C> {
    pub fn new(cmp: C, children: Vec<Box<dyn Iterator>>) -> Self {
        Self {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if child.valid() {
                match smallest {
                    Some(s) => {
                        if self.cmp.compare(child.key(), self.children[s].key())
                            == Ordering::Less
                        {
                            smallest = Some(i);
                        }
                    }
                    None => smallest = Some(i),
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if child.valid() {
                match largest {
                    Some(l) => {
                        if self.cmp.compare(child.key(), self.children[l].key())
                            == Ordering::Greater
                        {
                            largest = Some(i);
                        }
                    }
                    None => largest = Some(i),
                }
            }
        }
        self.current = largest;
    }
}

impl<C: Comparator> Iterator for MergingIterator<C> {
    fn valid(&self) -> bool {
        self.current.map_or(false, |i| self.children[i].valid())
    }

    fn seek_to_first(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in self.children.iter_mut() {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        let current = self.current.expect("invalid iterator");
        // All non-current children are already positioned after the
        // current key when moving forward. After a direction switch
        // they sit before it and must be realigned first.
        if self.direction != Direction::Forward {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }
        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("invalid iterator");
        if self.direction != Direction::Reverse {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    // child is at the first entry >= key; step back to
                    // the entry before key
                    child.prev();
                } else {
                    // everything in this child is < key
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }
        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("invalid iterator")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("invalid iterator")].value()
    }

    fn status(&mut self) -> Result<()> {
        for child in self.children.iter_mut() {
            child.status()?;
        }
        Ok(())
    }
}

/// Builds the data iterator referenced by an index entry.
pub trait DerivedIterFactory {
    type Iter: Iterator;
    fn derive(&self, value: &[u8]) -> Result<Self::Iter>;
}

/// A two-level iterator: walks an index whose values describe data
/// sources, lazily opening one data iterator at a time. Used to walk
/// the files of a level without opening them all.
pub struct ConcatenateIterator<I: Iterator, F: DerivedIterFactory> {
    index_iter: I,
    factory: F,
    data_iter: Option<F::Iter>,
    err: Option<Error>,
}

impl<I: Iterator, F: DerivedIterFactory> ConcatenateIterator<I, F> {
    pub fn new(index_iter: I, factory: F) -> Self {
        Self {
            index_iter,
            factory,
            data_iter: None,
            err: None,
        }
    }

    fn set_data_iter(&mut self) {
        if self.index_iter.valid() {
            match self.factory.derive(self.index_iter.value()) {
                Ok(iter) => self.data_iter = Some(iter),
                Err(e) => {
                    if self.err.is_none() {
                        self.err = Some(e);
                    }
                    self.data_iter = None;
                }
            }
        } else {
            self.data_iter = None;
        }
    }

    fn skip_forward_until_valid(&mut self) {
        while self.data_iter.as_ref().map_or(true, |i| !i.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.set_data_iter();
            if let Some(i) = self.data_iter.as_mut() {
                i.seek_to_first();
            }
        }
    }

    fn skip_backward_until_valid(&mut self) {
        while self.data_iter.as_ref().map_or(true, |i| !i.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.set_data_iter();
            if let Some(i) = self.data_iter.as_mut() {
                i.seek_to_last();
            }
        }
    }
}

impl<I: Iterator, F: DerivedIterFactory> Iterator for ConcatenateIterator<I, F> {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |i| i.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.set_data_iter();
        if let Some(i) = self.data_iter.as_mut() {
            i.seek_to_first();
        }
        self.skip_forward_until_valid();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.set_data_iter();
        if let Some(i) = self.data_iter.as_mut() {
            i.seek_to_last();
        }
        self.skip_backward_until_valid();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.set_data_iter();
        if let Some(i) = self.data_iter.as_mut() {
            i.seek(target);
        }
        self.skip_forward_until_valid();
    }

    fn next(&mut self) {
        self.data_iter.as_mut().expect("invalid iterator").next();
        self.skip_forward_until_valid();
    }

    fn prev(&mut self) {
        self.data_iter.as_mut().expect("invalid iterator").prev();
        self.skip_backward_until_valid();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("invalid iterator").value()
    }

    fn status(&mut self) -> Result<()> {
        if let Some(e) = self.err.take() {
            return Err(e);
        }
        self.index_iter.status()?;
        if let Some(i) = self.data_iter.as_mut() {
            i.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    /// A simple sorted in-memory iterator for tests.
    pub(crate) struct VecIterator {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        idx: Option<usize>,
    }

    impl VecIterator {
        pub(crate) fn new(mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Self { entries, idx: None }
        }
    }

    impl Iterator for VecIterator {
        fn valid(&self) -> bool {
            self.idx.map_or(false, |i| i < self.entries.len())
        }
        fn seek_to_first(&mut self) {
            self.idx = Some(0);
        }
        fn seek_to_last(&mut self) {
            self.idx = if self.entries.is_empty() {
                Some(self.entries.len())
            } else {
                Some(self.entries.len() - 1)
            };
        }
        fn seek(&mut self, target: &[u8]) {
            let pos = self
                .entries
                .partition_point(|(k, _)| k.as_slice() < target);
            self.idx = Some(pos);
        }
        fn next(&mut self) {
            let i = self.idx.expect("invalid iterator");
            self.idx = Some(i + 1);
        }
        fn prev(&mut self) {
            let i = self.idx.expect("invalid iterator");
            self.idx = if i == 0 { Some(self.entries.len()) } else { Some(i - 1) };
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.idx.unwrap()].0
        }
        fn value(&self) -> &[u8] {
            &self.entries[self.idx.unwrap()].1
        }
        fn status(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn kv(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
        (k.as_bytes().to_vec(), v.as_bytes().to_vec())
    }

    #[test]
    fn test_merging_iterator_forward() {
        let a = VecIterator::new(vec![kv("a", "1"), kv("d", "4"), kv("f", "6")]);
        let b = VecIterator::new(vec![kv("b", "2"), kv("c", "3"), kv("e", "5")]);
        let mut merged =
            MergingIterator::new(BytewiseComparator, vec![Box::new(a), Box::new(b)]);
        merged.seek_to_first();
        let mut got = vec![];
        while merged.valid() {
            got.push(String::from_utf8(merged.key().to_vec()).unwrap());
            merged.next();
        }
        assert_eq!(got, vec!["a", "b", "c", "d", "e", "f"]);
        merged.status().unwrap();
    }

    #[test]
    fn test_merging_iterator_seek_and_prev() {
        let a = VecIterator::new(vec![kv("a", "1"), kv("d", "4")]);
        let b = VecIterator::new(vec![kv("b", "2"), kv("e", "5")]);
        let mut merged =
            MergingIterator::new(BytewiseComparator, vec![Box::new(a), Box::new(b)]);
        merged.seek(b"c");
        assert!(merged.valid());
        assert_eq!(merged.key(), b"d");
        merged.prev();
        assert_eq!(merged.key(), b"b");
        merged.prev();
        assert_eq!(merged.key(), b"a");
        merged.prev();
        assert!(!merged.valid());
    }

    #[test]
    fn test_merging_iterator_equal_keys_prefer_first_child() {
        let newer = VecIterator::new(vec![kv("k", "new")]);
        let older = VecIterator::new(vec![kv("k", "old")]);
        let mut merged =
            MergingIterator::new(BytewiseComparator, vec![Box::new(newer), Box::new(older)]);
        merged.seek_to_first();
        assert_eq!(merged.value(), b"new");
        merged.next();
        assert_eq!(merged.value(), b"old");
        merged.next();
        assert!(!merged.valid());
    }

    #[test]
    fn test_merging_iterator_direction_switches() {
        let a = VecIterator::new(vec![kv("a", "1"), kv("c", "3")]);
        let b = VecIterator::new(vec![kv("b", "2"), kv("d", "4")]);
        let mut merged =
            MergingIterator::new(BytewiseComparator, vec![Box::new(a), Box::new(b)]);
        merged.seek_to_last();
        assert_eq!(merged.key(), b"d");
        merged.prev();
        assert_eq!(merged.key(), b"c");
        merged.next();
        assert_eq!(merged.key(), b"d");
        merged.prev();
        merged.prev();
        assert_eq!(merged.key(), b"b");
    }
}
