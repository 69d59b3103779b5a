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

use crate::db::format::InternalKey;
use crate::util::varint::{VarintU32, VarintU64};
use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

// Tag numbers for fields of a serialized VersionEdit. These numbers
// are part of the manifest format and must not change.
enum Tag {
    Comparator = 1,
    LogNumber = 2,
    NextFileNumber = 3,
    LastSequence = 4,
    CompactPointer = 5,
    DeletedFile = 6,
    NewFile = 7,
    // 8 was used for large value refs
    PrevLogNumber = 9,
    Unknown,
}

impl From<u32> for Tag {
    fn from(i: u32) -> Self {
        match i {
            1 => Tag::Comparator,
            2 => Tag::LogNumber,
            3 => Tag::NextFileNumber,
            4 => Tag::LastSequence,
            5 => Tag::CompactPointer,
            6 => Tag::DeletedFile,
            7 => Tag::NewFile,
            9 => Tag::PrevLogNumber,
            _ => Tag::Unknown,
        }
    }
}

/// Metadata of a single table file.
pub struct FileMetaData {
    // Seeks allowed until a compaction of this file is requested.
    // Decremented by reads that had to probe this file first and found
    // the key elsewhere.
    pub allowed_seeks: AtomicUsize,
    pub file_size: u64,
    pub number: u64,
    /// Smallest internal key served by the file
    pub smallest: InternalKey,
    /// Largest internal key served by the file
    pub largest: InternalKey,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        Self {
            allowed_seeks: AtomicUsize::new(0),
            file_size,
            number,
            smallest,
            largest,
        }
    }

    /// Initializes the seek budget from the file size: one seek is
    /// worth roughly 16KB of compaction work, with a floor of 100.
    pub fn init_allowed_seeks(&self) {
        let mut allowed = self.file_size as usize / 16384;
        if allowed < 100 {
            allowed = 100;
        }
        self.allowed_seeks.store(allowed, Ordering::Release);
    }

    /// Burns one seek. Returns true when the budget just hit zero.
    pub fn decrease_allowed_seeks(&self) -> bool {
        loop {
            let current = self.allowed_seeks.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .allowed_seeks
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return current == 1;
            }
        }
    }
}

impl Default for FileMetaData {
    fn default() -> Self {
        Self::new(0, 0, InternalKey::default(), InternalKey::default())
    }
}

impl Clone for FileMetaData {
    // the clone starts with a fresh seek budget
    fn clone(&self) -> Self {
        Self::new(
            self.number,
            self.file_size,
            self.smallest.clone(),
            self.largest.clone(),
        )
    }
}

impl PartialEq for FileMetaData {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.file_size == other.file_size
            && self.smallest == other.smallest
            && self.largest == other.largest
    }
}

impl Eq for FileMetaData {}

impl fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileMetaData {{ number: {}, file_size: {}, smallest: {:?}, largest: {:?} }}",
            self.number, self.file_size, self.smallest, self.largest
        )
    }
}

/// A delta between two versions, recorded in the manifest.
///
/// Serialized as a sequence of tagged fields; unset fields are simply
/// absent.
pub struct VersionEdit {
    max_levels: usize,
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,

    pub compaction_pointers: Vec<(usize, InternalKey)>,
    /// (level, file number) pairs removed by this edit
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, FileMetaData)>,
}

impl VersionEdit {
    pub fn new(max_levels: usize) -> Self {
        Self {
            max_levels,
            comparator_name: None,
            log_number: None,
            prev_log_number: None,
            next_file_number: None,
            last_sequence: None,
            compaction_pointers: vec![],
            deleted_files: vec![],
            new_files: vec![],
        }
    }

    pub fn clear(&mut self) {
        self.comparator_name = None;
        self.log_number = None;
        self.prev_log_number = None;
        self.next_file_number = None;
        self.last_sequence = None;
        self.compaction_pointers.clear();
        self.deleted_files.clear();
        self.new_files.clear();
    }

    pub fn set_comparator_name(&mut self, name: String) {
        self.comparator_name = Some(name);
    }

    pub fn set_log_number(&mut self, num: u64) {
        self.log_number = Some(num);
    }

    pub fn set_prev_log_number(&mut self, num: u64) {
        self.prev_log_number = Some(num);
    }

    pub fn set_next_file_number(&mut self, num: u64) {
        self.next_file_number = Some(num);
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        self.last_sequence = Some(seq);
    }

    /// Records a new table file at `level`.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        assert!(level < self.max_levels);
        self.new_files
            .push((level, FileMetaData::new(number, file_size, smallest, largest)));
    }

    /// Records the removal of file `number` from `level`.
    pub fn delete_file(&mut self, level: usize, number: u64) {
        assert!(level < self.max_levels);
        self.deleted_files.push((level, number));
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        if let Some(ref name) = self.comparator_name {
            VarintU32::put_varint(dst, Tag::Comparator as u32);
            VarintU32::put_varint_prefixed_slice(dst, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            VarintU32::put_varint(dst, Tag::LogNumber as u32);
            VarintU64::put_varint(dst, n);
        }
        if let Some(n) = self.prev_log_number {
            VarintU32::put_varint(dst, Tag::PrevLogNumber as u32);
            VarintU64::put_varint(dst, n);
        }
        if let Some(n) = self.next_file_number {
            VarintU32::put_varint(dst, Tag::NextFileNumber as u32);
            VarintU64::put_varint(dst, n);
        }
        if let Some(n) = self.last_sequence {
            VarintU32::put_varint(dst, Tag::LastSequence as u32);
            VarintU64::put_varint(dst, n);
        }
        for (level, key) in &self.compaction_pointers {
            VarintU32::put_varint(dst, Tag::CompactPointer as u32);
            VarintU32::put_varint(dst, *level as u32);
            VarintU32::put_varint_prefixed_slice(dst, key.data());
        }
        for (level, number) in &self.deleted_files {
            VarintU32::put_varint(dst, Tag::DeletedFile as u32);
            VarintU32::put_varint(dst, *level as u32);
            VarintU64::put_varint(dst, *number);
        }
        for (level, f) in &self.new_files {
            VarintU32::put_varint(dst, Tag::NewFile as u32);
            VarintU32::put_varint(dst, *level as u32);
            VarintU64::put_varint(dst, f.number);
            VarintU64::put_varint(dst, f.file_size);
            VarintU32::put_varint_prefixed_slice(dst, f.smallest.data());
            VarintU32::put_varint_prefixed_slice(dst, f.largest.data());
        }
    }

    pub fn decoded_from(&mut self, mut src: &[u8]) -> Result<()> {
        self.clear();
        let corrupted = |what: &str| Error::Corruption(format!("VersionEdit: {}", what));
        while let Some(tag) = VarintU32::drain_read(&mut src) {
            match Tag::from(tag) {
                Tag::Comparator => {
                    let raw = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| corrupted("comparator name"))?;
                    let name = String::from_utf8(raw.to_vec())
                        .map_err(|_| corrupted("comparator name"))?;
                    self.comparator_name = Some(name);
                }
                Tag::LogNumber => {
                    self.log_number = Some(
                        VarintU64::drain_read(&mut src).ok_or_else(|| corrupted("log number"))?,
                    );
                }
                Tag::PrevLogNumber => {
                    self.prev_log_number = Some(
                        VarintU64::drain_read(&mut src)
                            .ok_or_else(|| corrupted("previous log number"))?,
                    );
                }
                Tag::NextFileNumber => {
                    self.next_file_number = Some(
                        VarintU64::drain_read(&mut src)
                            .ok_or_else(|| corrupted("next file number"))?,
                    );
                }
                Tag::LastSequence => {
                    self.last_sequence = Some(
                        VarintU64::drain_read(&mut src)
                            .ok_or_else(|| corrupted("last sequence number"))?,
                    );
                }
                Tag::CompactPointer => {
                    let level = self.read_level(&mut src)?;
                    let key = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| corrupted("compaction pointer"))?;
                    self.compaction_pointers
                        .push((level, InternalKey::decoded_from(key)));
                }
                Tag::DeletedFile => {
                    let level = self.read_level(&mut src)?;
                    let number = VarintU64::drain_read(&mut src)
                        .ok_or_else(|| corrupted("deleted file"))?;
                    self.deleted_files.push((level, number));
                }
                Tag::NewFile => {
                    let level = self.read_level(&mut src)?;
                    let number =
                        VarintU64::drain_read(&mut src).ok_or_else(|| corrupted("new file"))?;
                    let file_size =
                        VarintU64::drain_read(&mut src).ok_or_else(|| corrupted("new file"))?;
                    let smallest = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| corrupted("new file"))?;
                    let largest = VarintU32::get_varint_prefixed_slice(&mut src)
                        .ok_or_else(|| corrupted("new file"))?;
                    self.new_files.push((
                        level,
                        FileMetaData::new(
                            number,
                            file_size,
                            InternalKey::decoded_from(smallest),
                            InternalKey::decoded_from(largest),
                        ),
                    ));
                }
                Tag::Unknown => return Err(corrupted("unknown tag")),
            }
        }
        Ok(())
    }

    fn read_level(&self, src: &mut &[u8]) -> Result<usize> {
        let level = VarintU32::drain_read(src)
            .ok_or_else(|| Error::Corruption("VersionEdit: level".to_owned()))?
            as usize;
        if level >= self.max_levels {
            return Err(Error::Corruption(format!(
                "VersionEdit: level {} out of range",
                level
            )));
        }
        Ok(level)
    }
}

impl fmt::Debug for VersionEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionEdit {{")?;
        if let Some(ref name) = self.comparator_name {
            write!(f, " comparator: {},", name)?;
        }
        if let Some(n) = self.log_number {
            write!(f, " log_number: {},", n)?;
        }
        if let Some(n) = self.prev_log_number {
            write!(f, " prev_log_number: {},", n)?;
        }
        if let Some(n) = self.next_file_number {
            write!(f, " next_file_number: {},", n)?;
        }
        if let Some(n) = self.last_sequence {
            write!(f, " last_sequence: {},", n)?;
        }
        for (level, key) in &self.compaction_pointers {
            write!(f, " compact_pointer: {} {:?},", level, key)?;
        }
        for (level, number) in &self.deleted_files {
            write!(f, " delete: {} {},", level, number)?;
        }
        for (level, file) in &self.new_files {
            write!(f, " add: {} {:?},", level, file)?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_round_trip(edit: &VersionEdit, max_levels: usize) {
        let mut encoded = vec![];
        edit.encode_to(&mut encoded);
        let mut decoded = VersionEdit::new(max_levels);
        decoded.decoded_from(&encoded).unwrap();
        let mut reencoded = vec![];
        decoded.encode_to(&mut reencoded);
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn test_empty_edit() {
        let edit = VersionEdit::new(7);
        let mut buf = vec![];
        edit.encode_to(&mut buf);
        assert!(buf.is_empty());
        assert_round_trip(&edit, 7);
    }

    #[test]
    fn test_round_trip_all_fields() {
        let big = 1u64 << 50;
        let mut edit = VersionEdit::new(7);
        edit.set_comparator_name("leveldb.BytewiseComparator".to_owned());
        edit.set_log_number(big + 100);
        edit.set_prev_log_number(big + 99);
        edit.set_next_file_number(big + 200);
        edit.set_last_sequence(big + 1000);
        edit.compaction_pointers
            .push((3, InternalKey::new(b"ptr", 7, crate::db::format::ValueType::Value)));
        edit.delete_file(4, big + 700);
        edit.add_file(
            5,
            big + 300,
            8888,
            InternalKey::new(b"aaa", 1, crate::db::format::ValueType::Value),
            InternalKey::new(b"zzz", 2, crate::db::format::ValueType::Deletion),
        );
        assert_round_trip(&edit, 7);

        let mut encoded = vec![];
        edit.encode_to(&mut encoded);
        let mut decoded = VersionEdit::new(7);
        decoded.decoded_from(&encoded).unwrap();
        assert_eq!(
            decoded.comparator_name.as_deref(),
            Some("leveldb.BytewiseComparator")
        );
        assert_eq!(decoded.log_number, Some(big + 100));
        assert_eq!(decoded.deleted_files, vec![(4, big + 700)]);
        assert_eq!(decoded.new_files.len(), 1);
        assert_eq!(decoded.new_files[0].0, 5);
        assert_eq!(decoded.new_files[0].1.number, big + 300);
        assert_eq!(decoded.new_files[0].1.file_size, 8888);
    }

    #[test]
    fn test_rejects_bad_level() {
        let mut edit = VersionEdit::new(12);
        edit.delete_file(9, 1);
        let mut encoded = vec![];
        edit.encode_to(&mut encoded);
        // a reader configured with fewer levels must reject the edit
        let mut decoded = VersionEdit::new(7);
        assert!(decoded.decoded_from(&encoded).is_err());
    }

    #[test]
    fn test_rejects_truncated_input() {
        let mut edit = VersionEdit::new(7);
        edit.set_comparator_name("cmp".to_owned());
        edit.set_last_sequence(123);
        let mut encoded = vec![];
        edit.encode_to(&mut encoded);
        for cut in 1..encoded.len() {
            let mut decoded = VersionEdit::new(7);
            // either a clean error or a lossy-but-consistent prefix;
            // never a panic
            let _ = decoded.decoded_from(&encoded[..cut]);
        }
        let mut decoded = VersionEdit::new(7);
        assert!(decoded.decoded_from(&encoded[..1]).is_err());
    }

    #[test]
    fn test_allowed_seeks() {
        let f = FileMetaData::new(1, 16384 * 250, InternalKey::default(), InternalKey::default());
        f.init_allowed_seeks();
        assert_eq!(f.allowed_seeks.load(Ordering::Acquire), 250);
        for _ in 0..249 {
            assert!(!f.decrease_allowed_seeks());
        }
        // the 250th seek exhausts the budget
        assert!(f.decrease_allowed_seeks());
        assert!(!f.decrease_allowed_seeks());

        let small = FileMetaData::new(2, 100, InternalKey::default(), InternalKey::default());
        small.init_allowed_seeks();
        assert_eq!(small.allowed_seeks.load(Ordering::Acquire), 100);
    }
}
