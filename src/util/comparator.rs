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

use std::cmp::{min, Ordering};

/// A `Comparator` provides a total order across byte slices that are
/// used as keys in an sstable or a database. A `Comparator` implementation
/// must be thread-safe since its methods may be invoked concurrently
/// from multiple threads.
pub trait Comparator: Send + Sync + Clone + Default {
    /// Three-way comparison.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// The name of the comparator. Used to check for comparator mismatches,
    /// i.e. a DB created with one comparator accessed using a different one.
    ///
    /// The client should switch to a new name whenever the comparator
    /// implementation changes in a way that causes the relative ordering
    /// of any two keys to change.
    fn name(&self) -> &str;

    /// Given keys `a < b`, returns a key `k` with `a <= k < b`.
    /// Used to shrink sstable index entries. A trivial implementation
    /// returns `a`.
    fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8>;

    /// Returns a key `k >= key`, ideally shorter than `key`.
    fn successor(&self, key: &[u8]) -> Vec<u8>;
}

/// Lexicographic byte-wise ordering.
#[derive(Clone, Copy, Default, Debug)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    #[inline]
    fn name(&self) -> &str {
        "leveldb.BytewiseComparator"
    }

    #[inline]
    fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8> {
        let min_size = min(a.len(), b.len());
        let mut diff_index = 0;
        while diff_index < min_size && a[diff_index] == b[diff_index] {
            diff_index += 1;
        }
        if diff_index < min_size {
            let diff = a[diff_index];
            if diff != 0xff && diff + 1 < b[diff_index] {
                let mut res = a[0..=diff_index].to_vec();
                res[diff_index] += 1;
                return res;
            }
        }
        // one is a prefix of the other, or the bytes differ by exactly one
        a.to_vec()
    }

    #[inline]
    fn successor(&self, key: &[u8]) -> Vec<u8> {
        // Find the first byte that can be incremented.
        for (i, &b) in key.iter().enumerate() {
            if b != 0xff {
                let mut res = key[0..=i].to_vec();
                res[i] += 1;
                return res;
            }
        }
        key.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytewise_separator() {
        let tests: Vec<(&str, &str, Vec<u8>)> = vec![
            ("", "1111", vec![]),
            ("1111", "", b"1111".to_vec()),
            ("1111", "111", b"1111".to_vec()),
            ("123", "1234", b"123".to_vec()),
            ("1234", "1234", b"1234".to_vec()),
            ("1111", "12345", b"1111".to_vec()),
            ("1111", "13345", vec![49, 50]),
        ];
        let c = BytewiseComparator;
        for (a, b, expect) in tests {
            assert_eq!(c.separator(a.as_bytes(), b.as_bytes()), expect);
        }
        // 0xff cannot be incremented
        let a: Vec<u8> = vec![48, 0xff];
        let b: Vec<u8> = vec![48, 49, 50, 51];
        assert_eq!(c.separator(&a, &b), a);
    }

    #[test]
    fn test_bytewise_successor() {
        let tests: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (vec![], vec![]),
            (b"111".to_vec(), vec![50]),
            (b"222".to_vec(), vec![51]),
            (vec![0xff, 0xff, 1], vec![0xff, 0xff, 2]),
            (vec![0xff, 0xff], vec![0xff, 0xff]),
        ];
        let c = BytewiseComparator;
        for (input, expect) in tests {
            assert_eq!(c.successor(&input), expect);
        }
    }
}
