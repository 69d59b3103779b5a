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

use crate::util::coding::{decode_fixed_64, put_fixed_64};
use crate::util::comparator::Comparator;
use std::cmp::Ordering;
use std::fmt;

/// The maximum sequence number, leaving the low 8 bits of the packed
/// tail for the value type.
pub const MAX_KEY_SEQUENCE: u64 = (1u64 << 56) - 1;

/// Length of the packed `sequence | type` suffix of an internal key.
pub const INTERNAL_KEY_TAIL: usize = 8;

/// The value type crammed into the tail of every internal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// A deletion tombstone.
    Deletion = 0,
    /// A normal value.
    Value = 1,
    /// Anything else, only produced by corrupted inputs.
    Unknown,
}

/// `Value` is the highest-numbered real type, so seeking with it finds
/// the newest entry for a user key first.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl From<u64> for ValueType {
    fn from(v: u64) -> Self {
        match v {
            0 => ValueType::Deletion,
            1 => ValueType::Value,
            _ => ValueType::Unknown,
        }
    }
}

/// Packs a sequence number and a value type into the 8 byte tail.
///
/// # Panics
///
/// Panics if `seq` exceeds `MAX_KEY_SEQUENCE`.
pub fn pack_seq_and_type(seq: u64, v_type: ValueType) -> u64 {
    assert!(
        seq <= MAX_KEY_SEQUENCE,
        "sequence number {} overflows the 56 bit space",
        seq
    );
    (seq << 8) | v_type as u64
}

/// Returns the user key portion of an internal key.
///
/// # Panics
///
/// Panics if `ikey` is shorter than the packed tail.
#[inline]
pub fn extract_user_key(ikey: &[u8]) -> &[u8] {
    assert!(
        ikey.len() >= INTERNAL_KEY_TAIL,
        "invalid internal key length {}",
        ikey.len()
    );
    &ikey[..ikey.len() - INTERNAL_KEY_TAIL]
}

/// An internal key destructured into its three parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub seq: u64,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn new(user_key: &'a [u8], seq: u64, value_type: ValueType) -> Self {
        Self {
            user_key,
            seq,
            value_type,
        }
    }

    /// Decodes an encoded internal key. Returns `None` if the input is
    /// too short or carries an unknown value type.
    pub fn decode_from(ikey: &'a [u8]) -> Option<Self> {
        if ikey.len() < INTERNAL_KEY_TAIL {
            return None;
        }
        let num = decode_fixed_64(&ikey[ikey.len() - INTERNAL_KEY_TAIL..]);
        let t = ValueType::from(num & 0xff);
        if t == ValueType::Unknown {
            return None;
        }
        Some(Self {
            user_key: &ikey[..ikey.len() - INTERNAL_KEY_TAIL],
            seq: num >> 8,
            value_type: t,
        })
    }

    pub fn encode(&self) -> InternalKey {
        InternalKey::new(self.user_key, self.seq, self.value_type)
    }
}

/// An encoded internal key: `user_key ++ fixed64(seq << 8 | type)`.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct InternalKey {
    data: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seq: u64, t: ValueType) -> Self {
        let mut data = Vec::with_capacity(user_key.len() + INTERNAL_KEY_TAIL);
        data.extend_from_slice(user_key);
        put_fixed_64(&mut data, pack_seq_and_type(seq, t));
        Self { data }
    }

    pub fn decoded_from(src: &[u8]) -> Self {
        Self { data: src.to_vec() }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.data)
    }

    pub fn parsed(&self) -> Option<ParsedInternalKey> {
        ParsedInternalKey::decode_from(&self.data)
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parsed() {
            Some(p) => write!(
                f,
                "'{}' @ {} : {:?}",
                String::from_utf8_lossy(p.user_key),
                p.seq,
                p.value_type
            ),
            None => write!(f, "(bad){:?}", self.data),
        }
    }
}

/// A key for looking up entries in the memtable and in tables: the
/// internal key for the given user key carrying the given sequence and
/// the max value type, so a seek lands on the newest visible entry.
pub struct LookupKey {
    data: Vec<u8>,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: u64) -> Self {
        let mut data = Vec::with_capacity(user_key.len() + INTERNAL_KEY_TAIL);
        data.extend_from_slice(user_key);
        put_fixed_64(&mut data, pack_seq_and_type(seq, VALUE_TYPE_FOR_SEEK));
        Self { data }
    }

    /// The internal key to seek with.
    pub fn internal_key(&self) -> &[u8] {
        &self.data
    }

    /// The user key portion.
    pub fn user_key(&self) -> &[u8] {
        &self.data[..self.data.len() - INTERNAL_KEY_TAIL]
    }
}

/// Orders internal keys by user key ascending, then sequence number
/// descending, then value type descending, so the newest entry for a
/// user key comes first.
#[derive(Clone, Default)]
pub struct InternalKeyComparator<C: Comparator> {
    pub user_comparator: C,
}

impl<C: Comparator> InternalKeyComparator<C> {
    pub fn new(ucmp: C) -> Self {
        Self {
            user_comparator: ucmp,
        }
    }
}

impl<C: Comparator> Comparator for InternalKeyComparator<C> {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self
            .user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
        {
            Ordering::Equal => {
                let a_num = decode_fixed_64(&a[a.len() - INTERNAL_KEY_TAIL..]);
                let b_num = decode_fixed_64(&b[b.len() - INTERNAL_KEY_TAIL..]);
                // bigger packed tails order first
                b_num.cmp(&a_num)
            }
            o => o,
        }
    }

    fn name(&self) -> &str {
        "leveldb.InternalKeyComparator"
    }

    fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8> {
        let ua = extract_user_key(a);
        let ub = extract_user_key(b);
        let sep = self.user_comparator.separator(ua, ub);
        if sep.len() < ua.len() && self.user_comparator.compare(ua, &sep) == Ordering::Less {
            // a physically shorter key that still orders correctly;
            // give it the max tail so it sorts before real entries with
            // the same user key
            let mut res = sep;
            put_fixed_64(
                &mut res,
                pack_seq_and_type(MAX_KEY_SEQUENCE, VALUE_TYPE_FOR_SEEK),
            );
            return res;
        }
        a.to_vec()
    }

    fn successor(&self, key: &[u8]) -> Vec<u8> {
        let ukey = extract_user_key(key);
        let suc = self.user_comparator.successor(ukey);
        if suc.len() < ukey.len() && self.user_comparator.compare(ukey, &suc) == Ordering::Less {
            let mut res = suc;
            put_fixed_64(
                &mut res,
                pack_seq_and_type(MAX_KEY_SEQUENCE, VALUE_TYPE_FOR_SEEK),
            );
            return res;
        }
        key.to_vec()
    }
}
