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

pub mod version_edit;
pub mod version_set;

use crate::db::format::{
    InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType,
};
use crate::iterator::{ConcatenateIterator, DerivedIterFactory, Iterator};
use crate::options::{Options, ReadOptions};
use crate::sstable::table::TableIterator;
use crate::storage::Storage;
use crate::table_cache::TableCache;
use crate::util::coding::{decode_fixed_64, put_fixed_64};
use crate::util::comparator::Comparator;
use crate::version::version_edit::FileMetaData;
use crate::{Error, Result};
use crossbeam_utils::sync::ShardedLock;
use std::cmp::Ordering as CmpOrdering;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// `(file, level)` of the table a read had to probe first before
/// finding its key elsewhere. Feeding these back into `update_stats`
/// drives seek-triggered compactions.
pub type SeekStats = (Arc<FileMetaData>, usize);

pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// An immutable snapshot of the table files at every level.
///
/// Versions are chained by the version set; readers pin one with an
/// `Arc` and the files it references stay live until the last reader
/// drops it.
pub struct Version<C: Comparator> {
    options: Arc<Options<C>>,
    icmp: InternalKeyComparator<C>,
    /// Files per level. Level 0 is ordered by file number (oldest
    /// first), deeper levels by smallest key and disjoint in range.
    pub files: Vec<Vec<Arc<FileMetaData>>>,

    // seek-compaction state, updated by reads
    file_to_compact: ShardedLock<Option<Arc<FileMetaData>>>,
    file_to_compact_level: AtomicUsize,

    /// Per-level size-compaction scores, set by `finalize`. A score
    /// >= 1 means the level is due; the picker takes the best-scored
    /// level whose pair is not already being compacted.
    pub compaction_scores: Vec<f64>,
}

impl<C: Comparator + 'static> Version<C> {
    pub fn new(options: Arc<Options<C>>, icmp: InternalKeyComparator<C>) -> Self {
        let max_levels = options.max_levels;
        Self {
            options,
            icmp,
            files: vec![vec![]; max_levels],
            file_to_compact: ShardedLock::new(None),
            file_to_compact_level: AtomicUsize::new(0),
            compaction_scores: vec![0.0; max_levels],
        }
    }

    pub fn options(&self) -> &Arc<Options<C>> {
        &self.options
    }

    pub fn comparator(&self) -> InternalKeyComparator<C> {
        self.icmp.clone()
    }

    #[inline]
    pub fn level_files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    /// Searches the key in this version's files, newest level first.
    ///
    /// Returns the value (or `None` for a tombstone or an absent key)
    /// plus the seek stats to charge, if any.
    pub fn get<S: Storage + Clone>(
        &self,
        opts: &ReadOptions,
        key: &LookupKey,
        table_cache: &TableCache<S>,
    ) -> Result<(Option<Vec<u8>>, Option<SeekStats>)> {
        let ikey = key.internal_key();
        let ukey = key.user_key();
        let ucmp = &self.icmp.user_comparator;
        let mut seek_stats: Option<SeekStats> = None;
        let mut last_file_read: Option<SeekStats> = None;
        for (level, files) in self.files.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            let candidates: Vec<Arc<FileMetaData>> = if level == 0 {
                // level 0 files overlap; probe every match, newest
                // file first
                let mut t: Vec<Arc<FileMetaData>> = files
                    .iter()
                    .filter(|f| {
                        ucmp.compare(ukey, f.smallest.user_key()) != CmpOrdering::Less
                            && ucmp.compare(ukey, f.largest.user_key()) != CmpOrdering::Greater
                    })
                    .cloned()
                    .collect();
                t.sort_by(|a, b| b.number.cmp(&a.number));
                t
            } else {
                let i = find_file(&self.icmp, files, ikey);
                match files.get(i) {
                    Some(f) if ucmp.compare(ukey, f.smallest.user_key()) != CmpOrdering::Less => {
                        vec![f.clone()]
                    }
                    _ => vec![],
                }
            };
            for f in candidates {
                // charge the first file probed once a second one is
                if seek_stats.is_none() {
                    if let Some(last) = last_file_read.take() {
                        seek_stats = Some(last);
                    }
                }
                last_file_read = Some((f.clone(), level));
                if let Some((found_key, found_value)) =
                    table_cache.get(&self.icmp, opts, ikey, f.number, f.file_size)?
                {
                    if let Some(parsed) = ParsedInternalKey::decode_from(&found_key) {
                        if ucmp.compare(parsed.user_key, ukey) == CmpOrdering::Equal {
                            return match parsed.value_type {
                                ValueType::Value => Ok((Some(found_value), seek_stats)),
                                ValueType::Deletion => Ok((None, seek_stats)),
                                ValueType::Unknown => Err(Error::Corruption(
                                    "unknown value type in table".to_owned(),
                                )),
                            };
                        }
                    }
                }
            }
        }
        Ok((None, seek_stats))
    }

    /// Charges one seek against the file in `stats`. Returns true when
    /// the file's seek budget ran out and a compaction of it is now
    /// wanted.
    pub fn update_stats(&self, stats: Option<SeekStats>) -> bool {
        if let Some((f, level)) = stats {
            if f.decrease_allowed_seeks() {
                let mut file_to_compact = self.file_to_compact.write().unwrap();
                if file_to_compact.is_none() {
                    *file_to_compact = Some(f);
                    self.file_to_compact_level.store(level, Ordering::Release);
                    return true;
                }
            }
        }
        false
    }

    /// Samples a key read by an iterator: when at least two files hold
    /// entries for its user key, the first one pays a seek.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        if let Some(parsed) = ParsedInternalKey::decode_from(internal_key) {
            let ucmp = &self.icmp.user_comparator;
            let ukey = parsed.user_key;
            let mut first: Option<SeekStats> = None;
            let mut matches = 0;
            for (level, files) in self.files.iter().enumerate() {
                if level == 0 {
                    for f in files.iter() {
                        if ucmp.compare(ukey, f.smallest.user_key()) != CmpOrdering::Less
                            && ucmp.compare(ukey, f.largest.user_key()) != CmpOrdering::Greater
                        {
                            matches += 1;
                            if first.is_none() {
                                first = Some((f.clone(), level));
                            }
                            if matches >= 2 {
                                return self.update_stats(first);
                            }
                        }
                    }
                } else if !files.is_empty() {
                    let i = find_file(&self.icmp, files, internal_key);
                    if let Some(f) = files.get(i) {
                        if ucmp.compare(ukey, f.smallest.user_key()) != CmpOrdering::Less {
                            matches += 1;
                            if first.is_none() {
                                first = Some((f.clone(), level));
                            }
                            if matches >= 2 {
                                return self.update_stats(first);
                            }
                        }
                    }
                }
            }
        }
        false
    }

    /// The file (and its level) whose seek budget ran out, if any.
    pub fn file_to_compact(&self) -> Option<SeekStats> {
        let file = self.file_to_compact.read().unwrap();
        file.as_ref()
            .map(|f| (f.clone(), self.file_to_compact_level.load(Ordering::Acquire)))
    }

    /// Whether any file in `level` overlaps `[smallest_ukey, largest_ukey]`.
    /// `None` bounds are infinite.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_ukey: Option<&[u8]>,
        largest_ukey: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_ukey,
            largest_ukey,
        )
    }

    /// All files in `level` overlapping the given internal key range.
    /// At level 0 the range is widened to cover transitively
    /// overlapping files, since level-0 files overlap each other.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = &self.icmp.user_comparator;
        let mut ubegin = begin.map(|ik| ik.user_key().to_vec());
        let mut uend = end.map(|ik| ik.user_key().to_vec());
        'restart: loop {
            let mut inputs = vec![];
            for f in self.files[level].iter() {
                let fstart = f.smallest.user_key();
                let flimit = f.largest.user_key();
                if ubegin
                    .as_deref()
                    .map_or(false, |b| ucmp.compare(flimit, b) == CmpOrdering::Less)
                {
                    continue;
                }
                if uend
                    .as_deref()
                    .map_or(false, |e| ucmp.compare(fstart, e) == CmpOrdering::Greater)
                {
                    continue;
                }
                if level == 0 {
                    if ubegin
                        .as_deref()
                        .map_or(false, |b| ucmp.compare(fstart, b) == CmpOrdering::Less)
                    {
                        ubegin = Some(fstart.to_vec());
                        continue 'restart;
                    }
                    if uend
                        .as_deref()
                        .map_or(false, |e| ucmp.compare(flimit, e) == CmpOrdering::Greater)
                    {
                        uend = Some(flimit.to_vec());
                        continue 'restart;
                    }
                }
                inputs.push(f.clone());
            }
            return inputs;
        }
    }

    /// Computes every level's size-compaction score. Level 0 is scored
    /// by file count, deeper levels by total bytes. The last level has
    /// nowhere to compact into and always scores 0.
    pub fn finalize(&mut self) {
        for level in 0..self.options.max_levels {
            self.compaction_scores[level] = if level + 1 >= self.options.max_levels {
                0.0
            } else if level == 0 {
                self.files[0].len() as f64 / self.options.l0_compaction_threshold as f64
            } else {
                total_file_size(&self.files[level]) as f64
                    / self.options.max_bytes_for_level(level) as f64
            };
        }
    }

    /// An estimate of the file offset at which `ikey` would live if the
    /// whole db were one sorted run.
    pub fn approximate_offset_of<S: Storage + Clone>(
        &self,
        ikey: &InternalKey,
        table_cache: &TableCache<S>,
    ) -> u64 {
        let mut result = 0;
        for (level, files) in self.files.iter().enumerate() {
            for f in files.iter() {
                if self.icmp.compare(f.largest.data(), ikey.data()) != CmpOrdering::Greater {
                    result += f.file_size;
                } else if self.icmp.compare(f.smallest.data(), ikey.data()) == CmpOrdering::Greater
                {
                    if level > 0 {
                        // files are sorted and disjoint past level 0
                        break;
                    }
                } else if let Ok(table) =
                    table_cache.find_table(&ReadOptions::default(), f.number, f.file_size)
                {
                    result += table.approximate_offset_of(&self.icmp, ikey.data());
                }
            }
        }
        result
    }

    /// Appends one iterator per level-0 file and one concatenating
    /// iterator per deeper level.
    pub fn append_iterators<S: Storage + Clone + 'static>(
        &self,
        opts: &ReadOptions,
        table_cache: &TableCache<S>,
        iters: &mut Vec<Box<dyn Iterator>>,
    ) -> Result<()> {
        for f in self.files[0].iter().rev() {
            iters.push(Box::new(table_cache.new_iter(
                self.icmp.clone(),
                opts,
                f.number,
                f.file_size,
            )?));
        }
        for files in self.files.iter().skip(1) {
            if files.is_empty() {
                continue;
            }
            let index_iter = LevelFileNumIterator::new(self.icmp.clone(), files.to_vec());
            let factory = FileIterFactory::new(self.icmp.clone(), opts.clone(), table_cache.clone());
            iters.push(Box::new(ConcatenateIterator::new(index_iter, factory)));
        }
        Ok(())
    }

    /// A short per-level file count summary for the info log.
    pub fn level_summary(&self) -> String {
        let mut s = String::from("files[ ");
        for files in self.files.iter() {
            let _ = write!(s, "{} ", files.len());
        }
        s.push(']');
        s
    }
}

/// Index of the first file in `files` whose largest key is at or past
/// `ikey`. `files` must be sorted by smallest key and disjoint.
pub fn find_file<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    files: &[Arc<FileMetaData>],
    ikey: &[u8],
) -> usize {
    let mut left = 0;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(files[mid].largest.data(), ikey) == CmpOrdering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    right
}

fn key_is_after_file<C: Comparator>(
    ucmp: &C,
    ukey: Option<&[u8]>,
    f: &Arc<FileMetaData>,
) -> bool {
    ukey.map_or(false, |k| {
        ucmp.compare(k, f.largest.user_key()) == CmpOrdering::Greater
    })
}

fn key_is_before_file<C: Comparator>(
    ucmp: &C,
    ukey: Option<&[u8]>,
    f: &Arc<FileMetaData>,
) -> bool {
    ukey.map_or(false, |k| {
        ucmp.compare(k, f.smallest.user_key()) == CmpOrdering::Less
    })
}

/// Whether any file overlaps the user key range. `disjoint` promises
/// the files are sorted and non-overlapping, enabling a binary search.
pub fn some_file_overlaps_range<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    disjoint: bool,
    files: &[Arc<FileMetaData>],
    smallest_ukey: Option<&[u8]>,
    largest_ukey: Option<&[u8]>,
) -> bool {
    let ucmp = &icmp.user_comparator;
    if !disjoint {
        return files.iter().any(|f| {
            !(key_is_after_file(ucmp, smallest_ukey, f) || key_is_before_file(ucmp, largest_ukey, f))
        });
    }
    let index = match smallest_ukey {
        Some(ukey) => {
            let lookup = LookupKey::new(ukey, crate::db::format::MAX_KEY_SEQUENCE);
            find_file(icmp, files, lookup.internal_key())
        }
        None => 0,
    };
    match files.get(index) {
        Some(f) => !key_is_before_file(ucmp, largest_ukey, f),
        None => false,
    }
}

/// Iterates the files of a level past 0 as `largest key -> (number,
/// size)` entries, backing a `ConcatenateIterator`.
pub struct LevelFileNumIterator<C: Comparator> {
    icmp: InternalKeyComparator<C>,
    files: Vec<Arc<FileMetaData>>,
    // files.len() means "invalid"
    index: usize,
    value_buf: Vec<u8>,
}

impl<C: Comparator> LevelFileNumIterator<C> {
    pub fn new(icmp: InternalKeyComparator<C>, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        Self {
            icmp,
            files,
            index,
            value_buf: vec![],
        }
    }

    fn fill_value(&mut self) {
        if self.valid() {
            let f = &self.files[self.index];
            self.value_buf.clear();
            put_fixed_64(&mut self.value_buf, f.number);
            put_fixed_64(&mut self.value_buf, f.file_size);
        }
    }
}

impl<C: Comparator> Iterator for LevelFileNumIterator<C> {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.fill_value();
    }

    fn seek_to_last(&mut self) {
        self.index = if self.files.is_empty() {
            0
        } else {
            self.files.len() - 1
        };
        self.fill_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.fill_value();
    }

    fn next(&mut self) {
        assert!(self.valid(), "invalid iterator");
        self.index += 1;
        self.fill_value();
    }

    fn prev(&mut self) {
        assert!(self.valid(), "invalid iterator");
        self.index = match self.index {
            0 => self.files.len(),
            i => i - 1,
        };
        self.fill_value();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid(), "invalid iterator");
        self.files[self.index].largest.data()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid(), "invalid iterator");
        &self.value_buf
    }

    fn status(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens the table iterator described by a `LevelFileNumIterator`
/// value.
pub struct FileIterFactory<S: Storage + Clone, C: Comparator> {
    icmp: InternalKeyComparator<C>,
    opts: ReadOptions,
    table_cache: TableCache<S>,
}

impl<S: Storage + Clone, C: Comparator> FileIterFactory<S, C> {
    pub fn new(
        icmp: InternalKeyComparator<C>,
        opts: ReadOptions,
        table_cache: TableCache<S>,
    ) -> Self {
        Self {
            icmp,
            opts,
            table_cache,
        }
    }
}

impl<S: Storage + Clone, C: Comparator> DerivedIterFactory for FileIterFactory<S, C> {
    type Iter = TableIterator<InternalKeyComparator<C>>;

    fn derive(&self, value: &[u8]) -> Result<Self::Iter> {
        if value.len() != 16 {
            return Err(Error::Corruption(
                "file entry for level iterator is ill-formed".to_owned(),
            ));
        }
        let file_number = decode_fixed_64(&value[..8]);
        let file_size = decode_fixed_64(&value[8..]);
        self.table_cache
            .new_iter(self.icmp.clone(), &self.opts, file_number, file_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    fn icmp() -> InternalKeyComparator<BytewiseComparator> {
        InternalKeyComparator::new(BytewiseComparator)
    }

    fn file(number: u64, smallest: &str, largest: &str) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            number * 100,
            InternalKey::new(smallest.as_bytes(), 100, ValueType::Value),
            InternalKey::new(largest.as_bytes(), 100, ValueType::Value),
        ))
    }

    fn seek_key(ukey: &str) -> Vec<u8> {
        LookupKey::new(ukey.as_bytes(), crate::db::format::MAX_KEY_SEQUENCE)
            .internal_key()
            .to_vec()
    }

    #[test]
    fn test_find_file() {
        let c = icmp();
        let files = vec![file(1, "c", "e"), file(2, "g", "i"), file(3, "k", "m")];
        assert_eq!(find_file(&c, &files, &seek_key("a")), 0);
        assert_eq!(find_file(&c, &files, &seek_key("d")), 0);
        assert_eq!(find_file(&c, &files, &seek_key("f")), 1);
        assert_eq!(find_file(&c, &files, &seek_key("i")), 1);
        assert_eq!(find_file(&c, &files, &seek_key("n")), 3);
        assert_eq!(find_file(&c, &[], &seek_key("a")), 0);
    }

    #[test]
    fn test_some_file_overlaps_range_disjoint() {
        let c = icmp();
        let files = vec![file(1, "c", "e"), file(2, "g", "i")];
        let check = |lo: Option<&str>, hi: Option<&str>| {
            some_file_overlaps_range(
                &c,
                true,
                &files,
                lo.map(|s| s.as_bytes()),
                hi.map(|s| s.as_bytes()),
            )
        };
        assert!(!check(Some("a"), Some("b")));
        assert!(check(Some("a"), Some("c")));
        assert!(check(Some("d"), Some("d")));
        assert!(!check(Some("f"), Some("f")));
        assert!(check(Some("f"), Some("g")));
        assert!(!check(Some("j"), None));
        assert!(check(None, Some("c")));
        assert!(check(None, None));
    }

    #[test]
    fn test_some_file_overlaps_range_overlapping() {
        let c = icmp();
        // level-0 style files overlapping each other
        let files = vec![file(1, "a", "m"), file(2, "h", "z")];
        let check = |lo: Option<&str>, hi: Option<&str>| {
            some_file_overlaps_range(
                &c,
                false,
                &files,
                lo.map(|s| s.as_bytes()),
                hi.map(|s| s.as_bytes()),
            )
        };
        assert!(check(Some("h"), Some("h")));
        assert!(check(Some("y"), None));
        assert!(!check(None, Some("0")));
    }

    fn version_with(files: Vec<(usize, Arc<FileMetaData>)>) -> Version<BytewiseComparator> {
        let options = Arc::new(Options::<BytewiseComparator>::default());
        let mut v = Version::new(options, icmp());
        for (level, f) in files {
            v.files[level].push(f);
        }
        v
    }

    #[test]
    fn test_get_overlapping_inputs_level0_widens() {
        let v = version_with(vec![
            (0, file(1, "a", "c")),
            (0, file(2, "c", "g")),
            (0, file(3, "h", "j")),
        ]);
        // "b".."b" pulls in file 1, which overlaps file 2 at "c", which
        // widens the range again
        let begin = InternalKey::new(b"b", 100, ValueType::Value);
        let end = InternalKey::new(b"b", 100, ValueType::Value);
        let got = v.get_overlapping_inputs(0, Some(&begin), Some(&end));
        let numbers: Vec<u64> = got.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_get_overlapping_inputs_deep_level() {
        let v = version_with(vec![
            (2, file(1, "a", "c")),
            (2, file(2, "e", "g")),
            (2, file(3, "i", "k")),
        ]);
        let begin = InternalKey::new(b"f", 100, ValueType::Value);
        let end = InternalKey::new(b"j", 100, ValueType::Value);
        let got = v.get_overlapping_inputs(2, Some(&begin), Some(&end));
        let numbers: Vec<u64> = got.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);
        assert_eq!(v.get_overlapping_inputs(2, None, None).len(), 3);
    }

    #[test]
    fn test_finalize_scores() {
        let options = Arc::new(Options::<BytewiseComparator>::default());
        let mut v = Version::new(options.clone(), icmp());
        // 2 files at L0 with a threshold of 4
        v.files[0].push(file(1, "a", "b"));
        v.files[0].push(file(2, "c", "d"));
        v.finalize();
        assert!((v.compaction_scores[0] - 0.5).abs() < 1e-9);
        assert_eq!(v.compaction_scores[2], 0.0);

        // an oversized L2 scores independently of L0
        let huge = Arc::new(FileMetaData::new(
            9,
            options.max_bytes_for_level(2) * 2,
            InternalKey::new(b"a", 1, ValueType::Value),
            InternalKey::new(b"z", 1, ValueType::Value),
        ));
        v.files[2].push(huge);
        v.finalize();
        assert!(v.compaction_scores[2] >= 2.0);
        assert!((v.compaction_scores[0] - 0.5).abs() < 1e-9);
        // the deepest level never scores
        assert_eq!(*v.compaction_scores.last().unwrap(), 0.0);
    }

    #[test]
    fn test_update_stats_triggers_once() {
        let v = version_with(vec![(1, file(1, "a", "m")), (1, file(2, "n", "z"))]);
        let f = v.files[1][0].clone();
        f.allowed_seeks.store(2, Ordering::Release);
        assert!(!v.update_stats(Some((f.clone(), 1))));
        assert!(v.update_stats(Some((f.clone(), 1))));
        let (picked, level) = v.file_to_compact().unwrap();
        assert_eq!(picked.number, 1);
        assert_eq!(level, 1);
        // a second exhausted file does not displace the first
        let g = v.files[1][1].clone();
        g.allowed_seeks.store(1, Ordering::Release);
        assert!(!v.update_stats(Some((g, 1))));
        assert_eq!(v.file_to_compact().unwrap().0.number, 1);
    }

    #[test]
    fn test_level_file_num_iterator() {
        let files = vec![file(7, "a", "c"), file(8, "e", "g"), file(9, "i", "k")];
        let mut iter = LevelFileNumIterator::new(icmp(), files);
        assert!(!iter.valid());
        iter.seek_to_first();
        assert_eq!(decode_fixed_64(&iter.value()[..8]), 7);
        iter.seek(&seek_key("f"));
        assert_eq!(decode_fixed_64(&iter.value()[..8]), 8);
        assert_eq!(decode_fixed_64(&iter.value()[8..]), 800);
        iter.next();
        assert_eq!(decode_fixed_64(&iter.value()[..8]), 9);
        iter.next();
        assert!(!iter.valid());
        iter.seek_to_last();
        iter.prev();
        assert_eq!(decode_fixed_64(&iter.value()[..8]), 8);
    }

    #[test]
    fn test_level_summary() {
        let v = version_with(vec![(0, file(1, "a", "b")), (2, file(2, "c", "d"))]);
        assert_eq!(v.level_summary(), "files[ 1 0 1 0 0 0 0 ]");
    }
}
