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

use crate::db::format::{InternalKey, InternalKeyComparator};
use crate::options::Options;
use crate::sstable::table::TableBuilder;
use crate::storage::File;
use crate::util::comparator::Comparator;
use crate::version::version_edit::{FileMetaData, VersionEdit};
use crate::version::{total_file_size, Version};
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

/// Why a compaction was scheduled. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    /// A level outgrew its size (or file count) limit.
    MaxSize,
    /// An optimistic background pass found a cheap merge.
    Ratio,
    /// A file exhausted its seek budget.
    Seek,
    /// Requested by `compact_range`.
    Manual,
}

/// A compaction merging the files of `inputs[0]` at `level` with the
/// overlapping files of `inputs[1]` at `level + 1`, writing the merged
/// output to `level + 1`.
pub struct Compaction<F: File, C: Comparator> {
    options: Arc<Options<C>>,
    pub reason: CompactionReason,
    pub level: usize,

    /// The version this compaction was planned against, pinned so its
    /// input files stay live.
    pub input_version: Option<Arc<Version<C>>>,
    /// The edit describing this compaction's effect.
    pub edit: VersionEdit,
    /// `[files at level, overlapping files at level + 1]`
    pub inputs: [Vec<Arc<FileMetaData>>; 2],

    // State for cutting output files when they overlap too much of
    // level + 2.
    pub grandparents: Vec<Arc<FileMetaData>>,
    pub grandparent_index: usize,
    pub seen_key: bool,
    pub overlapped_bytes: u64,

    // Per-level cursors for `key_exist_in_deeper_levels`. Keys are fed
    // in sorted order so each cursor only moves forward.
    pub level_ptrs: Vec<usize>,

    /// The builder of the output file currently being written.
    pub builder: Option<TableBuilder<F, InternalKeyComparator<C>>>,
    pub outputs: Vec<FileMetaData>,
    /// Total bytes written to finished outputs.
    pub total_bytes: u64,
}

impl<F: File, C: Comparator + 'static> Compaction<F, C> {
    pub fn new(options: Arc<Options<C>>, level: usize, reason: CompactionReason) -> Self {
        let max_levels = options.max_levels;
        Self {
            options: options.clone(),
            reason,
            level,
            input_version: None,
            edit: VersionEdit::new(max_levels),
            inputs: [vec![], vec![]],
            grandparents: vec![],
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: vec![0; max_levels],
            builder: None,
            outputs: vec![],
            total_bytes: 0,
        }
    }

    /// The level the merged output lands on.
    #[inline]
    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    /// Whether this compaction can be carried out by renaming a single
    /// input file into the next level, with no merging at all. Moving
    /// a file under a fat grandparent overlap is refused, since a later
    /// compaction of the parent would get too expensive.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= self.options.max_grandparent_overlap_bytes()
    }

    /// The ratio of bytes this compaction moves out of `level` to the
    /// bytes it must rewrite at `level + 1`. Used to judge optimistic
    /// compactions; a trivial move has no rewrite cost at all.
    pub fn work_ratio(&self) -> f64 {
        let moved = total_file_size(&self.inputs[0]) as f64;
        let rewritten = total_file_size(&self.inputs[1]) as f64;
        if rewritten == 0.0 {
            f64::INFINITY
        } else {
            moved / rewritten
        }
    }

    /// The key range covered by `inputs[0]`.
    pub fn base_range(&self, icmp: &InternalKeyComparator<C>) -> (InternalKey, InternalKey) {
        key_range(icmp, &self.inputs[0])
    }

    /// The key range covered by both input levels.
    pub fn total_range(&self, icmp: &InternalKeyComparator<C>) -> (InternalKey, InternalKey) {
        let all: Vec<Arc<FileMetaData>> = self
            .inputs
            .iter()
            .flat_map(|fs| fs.iter().cloned())
            .collect();
        key_range(icmp, &all)
    }

    /// Called with every output key in order; returns true when the
    /// current output file should be cut before `ikey` because it has
    /// come to overlap too many grandparent bytes.
    pub fn should_stop_before(&mut self, ikey: &[u8], icmp: &InternalKeyComparator<C>) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(
                ikey,
                self.grandparents[self.grandparent_index].largest.data(),
            ) == CmpOrdering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;
        if self.overlapped_bytes > self.options.max_grandparent_overlap_bytes() {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Whether any level below the output level may hold an entry for
    /// `ukey`. When it cannot, a tombstone for `ukey` is safe to drop.
    ///
    /// Keys must be fed in sorted order.
    pub fn key_exist_in_deeper_levels(&mut self, ukey: &[u8]) -> bool {
        if let Some(version) = &self.input_version {
            let ucmp = &version.comparator().user_comparator;
            let max_levels = self.options.max_levels;
            for level in self.output_level() + 1..max_levels {
                let files = version.level_files(level);
                while self.level_ptrs[level] < files.len() {
                    let f = &files[self.level_ptrs[level]];
                    if ucmp.compare(ukey, f.largest.user_key()) != CmpOrdering::Greater {
                        if ucmp.compare(ukey, f.smallest.user_key()) != CmpOrdering::Less {
                            return true;
                        }
                        break;
                    }
                    self.level_ptrs[level] += 1;
                }
            }
        }
        false
    }

    /// Records the deletion of every input file and the addition of
    /// every output file in `edit`.
    pub fn apply_to_edit(&mut self) {
        for (delta, files) in self.inputs.iter().enumerate() {
            for f in files.iter() {
                self.edit.delete_file(self.level + delta, f.number);
            }
        }
        for output in self.outputs.drain(..) {
            self.edit.new_files.push((self.level + 1, output));
        }
    }

    /// Total bytes across all input files.
    pub fn total_input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }
}

/// The smallest and largest internal key covered by `files`.
pub fn key_range<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    files: &[Arc<FileMetaData>],
) -> (InternalKey, InternalKey) {
    assert!(!files.is_empty(), "empty file set has no key range");
    let mut smallest = files[0].smallest.clone();
    let mut largest = files[0].largest.clone();
    for f in files.iter().skip(1) {
        if icmp.compare(f.smallest.data(), smallest.data()) == CmpOrdering::Less {
            smallest = f.smallest.clone();
        }
        if icmp.compare(f.largest.data(), largest.data()) == CmpOrdering::Greater {
            largest = f.largest.clone();
        }
    }
    (smallest, largest)
}

/// A manually requested compaction of a user key range at one level.
pub struct ManualCompaction {
    pub level: usize,
    pub done: bool,
    pub begin: Option<InternalKey>,
    pub end: Option<InternalKey>,
}

/// Running totals for compactions into one level.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionStats {
    pub micros: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl CompactionStats {
    pub fn accumulate(&mut self, micros: u64, bytes_read: u64, bytes_written: u64) {
        self.micros += micros;
        self.bytes_read += bytes_read;
        self.bytes_written += bytes_written;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format::ValueType;
    use crate::options::Options;
    use crate::storage::mem::InmemFile;
    use crate::util::comparator::BytewiseComparator;
    use crate::version::Version;

    fn icmp() -> InternalKeyComparator<BytewiseComparator> {
        InternalKeyComparator::new(BytewiseComparator)
    }

    fn file(number: u64, size: u64, smallest: &str, largest: &str) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            size,
            InternalKey::new(smallest.as_bytes(), 100, ValueType::Value),
            InternalKey::new(largest.as_bytes(), 100, ValueType::Value),
        ))
    }

    fn new_compaction(level: usize) -> Compaction<InmemFile, BytewiseComparator> {
        Compaction::new(Arc::new(Options::default()), level, CompactionReason::MaxSize)
    }

    #[test]
    fn test_is_trivial_move() {
        let mut c = new_compaction(1);
        c.inputs[0].push(file(1, 100, "a", "c"));
        assert!(c.is_trivial_move());
        // a second base file forces a merge
        c.inputs[0].push(file(2, 100, "d", "e"));
        assert!(!c.is_trivial_move());
        // parent-level overlap forces a merge
        let mut c = new_compaction(1);
        c.inputs[0].push(file(1, 100, "a", "c"));
        c.inputs[1].push(file(3, 100, "b", "d"));
        assert!(!c.is_trivial_move());
        // heavy grandparent overlap refuses the move
        let mut c = new_compaction(1);
        let limit = c.options.max_grandparent_overlap_bytes();
        c.inputs[0].push(file(1, 100, "a", "c"));
        c.grandparents.push(file(4, limit + 1, "a", "z"));
        assert!(!c.is_trivial_move());
    }

    #[test]
    fn test_work_ratio() {
        let mut c = new_compaction(1);
        c.inputs[0].push(file(1, 900, "a", "c"));
        assert!(c.work_ratio().is_infinite());
        c.inputs[1].push(file(2, 1000, "a", "d"));
        assert!((c.work_ratio() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_key_ranges() {
        let mut c = new_compaction(1);
        c.inputs[0].push(file(1, 100, "d", "f"));
        c.inputs[0].push(file(2, 100, "a", "c"));
        c.inputs[1].push(file(3, 100, "e", "k"));
        let (s, l) = c.base_range(&icmp());
        assert_eq!(s.user_key(), b"a");
        assert_eq!(l.user_key(), b"f");
        let (s, l) = c.total_range(&icmp());
        assert_eq!(s.user_key(), b"a");
        assert_eq!(l.user_key(), b"k");
    }

    #[test]
    fn test_should_stop_before() {
        let mut c = new_compaction(1);
        let limit = c.options.max_grandparent_overlap_bytes();
        c.grandparents.push(file(1, limit, "a", "c"));
        c.grandparents.push(file(2, limit, "d", "f"));
        c.grandparents.push(file(3, limit, "g", "i"));
        let cmp = icmp();
        let key = |u: &str| InternalKey::new(u.as_bytes(), 50, ValueType::Value);
        // the first key never cuts, whatever it skips
        assert!(!c.should_stop_before(key("e").data(), &cmp));
        // moving past one grandparent of `limit` bytes does not cut yet
        assert!(!c.should_stop_before(key("g").data(), &cmp));
        // but a further step accumulates past the limit
        assert!(c.should_stop_before(key("z").data(), &cmp));
        // the counter resets after a cut
        assert!(!c.should_stop_before(key("z").data(), &cmp));
    }

    #[test]
    fn test_key_exist_in_deeper_levels() {
        let options = Arc::new(Options::<BytewiseComparator>::default());
        let mut version = Version::new(options.clone(), icmp());
        version.files[3].push(file(10, 100, "d", "f"));
        version.files[4].push(file(11, 100, "m", "p"));
        let mut c: Compaction<InmemFile, BytewiseComparator> =
            Compaction::new(options, 1, CompactionReason::MaxSize);
        c.input_version = Some(Arc::new(version));
        assert!(!c.key_exist_in_deeper_levels(b"a"));
        assert!(c.key_exist_in_deeper_levels(b"e"));
        assert!(!c.key_exist_in_deeper_levels(b"g"));
        assert!(c.key_exist_in_deeper_levels(b"n"));
        assert!(!c.key_exist_in_deeper_levels(b"q"));
    }

    #[test]
    fn test_apply_to_edit() {
        let mut c = new_compaction(2);
        c.inputs[0].push(file(1, 100, "a", "c"));
        c.inputs[1].push(file(2, 100, "b", "d"));
        c.outputs.push(FileMetaData::new(
            9,
            150,
            InternalKey::new(b"a", 100, ValueType::Value),
            InternalKey::new(b"d", 90, ValueType::Value),
        ));
        c.apply_to_edit();
        assert_eq!(c.edit.deleted_files, vec![(2, 1), (3, 2)]);
        assert_eq!(c.edit.new_files.len(), 1);
        assert_eq!(c.edit.new_files[0].0, 3);
        assert_eq!(c.edit.new_files[0].1.number, 9);
    }
}
