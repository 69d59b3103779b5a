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

use crate::compaction::{key_range, Compaction, CompactionReason, ManualCompaction};
use crate::db::filename::{generate_filename, FileType};
use crate::db::format::{InternalKey, InternalKeyComparator, MAX_KEY_SEQUENCE};
use crate::options::Options;
use crate::record::reader::Reader;
use crate::record::writer::Writer;
use crate::snapshot::SnapshotList;
use crate::storage::{File, Storage};
use crate::table_cache::TableCache;
use crate::util::comparator::Comparator;
use crate::util::reporter::LogReporter;
use crate::version::version_edit::{FileMetaData, VersionEdit};
use crate::version::{total_file_size, Version};
use crate::{Error, Result};
use hashbrown::HashSet;
use log::info;
use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::Arc;

struct LevelState {
    deleted_files: HashSet<u64>,
    added_files: Vec<Arc<FileMetaData>>,
}

/// Accumulates version edits atop a base version and materializes the
/// resulting new version. Used both by the commit path and by manifest
/// recovery.
pub struct VersionBuilder<C: Comparator> {
    base: Arc<Version<C>>,
    levels: Vec<LevelState>,
}

impl<C: Comparator + 'static> VersionBuilder<C> {
    pub fn new(base: Arc<Version<C>>) -> Self {
        let max_levels = base.options().max_levels;
        let mut levels = Vec::with_capacity(max_levels);
        for _ in 0..max_levels {
            levels.push(LevelState {
                deleted_files: HashSet::new(),
                added_files: vec![],
            });
        }
        Self { base, levels }
    }

    /// Applies one edit, updating the per-level compaction pointers as
    /// a side effect.
    pub fn accumulate(&mut self, edit: &VersionEdit, compaction_pointers: &mut [InternalKey]) {
        for (level, key) in &edit.compaction_pointers {
            compaction_pointers[*level] = key.clone();
        }
        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted_files.insert(*number);
        }
        for (level, f) in &edit.new_files {
            let meta = Arc::new(f.clone());
            meta.init_allowed_seeks();
            self.levels[*level].deleted_files.remove(&meta.number);
            self.levels[*level].added_files.push(meta);
        }
    }

    /// Builds the new version. Level 0 stays ordered by file number,
    /// deeper levels by smallest key.
    ///
    /// # Panics
    ///
    /// Panics if the merged file set overlaps within a level past 0,
    /// which would mean a corrupted edit sequence.
    pub fn apply_to_new(&mut self, icmp: &InternalKeyComparator<C>) -> Version<C> {
        let mut v = Version::new(self.base.options().clone(), icmp.clone());
        for (level, state) in self.levels.iter_mut().enumerate() {
            let mut files: Vec<Arc<FileMetaData>> = self
                .base
                .level_files(level)
                .iter()
                .filter(|f| !state.deleted_files.contains(&f.number))
                .cloned()
                .collect();
            files.extend(
                state
                    .added_files
                    .drain(..)
                    .filter(|f| !state.deleted_files.contains(&f.number)),
            );
            if level == 0 {
                files.sort_by(|a, b| a.number.cmp(&b.number));
            } else {
                files.sort_by(|a, b| {
                    match icmp.compare(a.smallest.data(), b.smallest.data()) {
                        CmpOrdering::Equal => a.number.cmp(&b.number),
                        o => o,
                    }
                });
                for w in files.windows(2) {
                    assert!(
                        icmp.compare(w[0].largest.data(), w[1].smallest.data())
                            == CmpOrdering::Less,
                        "files {} and {} overlap at level {}",
                        w[0].number,
                        w[1].number,
                        level
                    );
                }
            }
            v.files[level] = files;
        }
        v
    }
}

/// Owns the chain of live versions and everything needed to move from
/// one version to the next: file number and sequence counters, the
/// manifest writer, the compaction picker state, the level-pair locks
/// shared by the two compaction loops, and the snapshot list.
///
/// The whole struct is protected by the one db mutex. The manifest
/// write itself happens with that mutex released; `manifest_write_busy`
/// keeps a second committer out while it is in flight.
pub struct VersionSet<S: Storage + Clone, C: Comparator> {
    env: S,
    db_path: String,
    options: Arc<Options<C>>,
    icmp: InternalKeyComparator<C>,
    pub table_cache: TableCache<S>,

    next_file_number: u64,
    manifest_file_number: u64,
    log_number: u64,
    prev_log_number: u64,
    last_sequence: u64,

    pub(crate) manifest_writer: Option<Writer<S::F>>,
    pub(crate) manifest_write_busy: bool,

    // newest version first; front() is current
    versions: VecDeque<Arc<Version<C>>>,
    compaction_pointers: Vec<InternalKey>,

    // level_locks[l] is true while some compaction reads level l or
    // writes into it; a compaction of the pair (l, l+1) takes both
    level_locks: Vec<bool>,

    pub snapshots: SnapshotList,
    /// Output file numbers of in-flight flushes and compactions, kept
    /// out of obsolete-file deletion.
    pub pending_outputs: HashSet<u64>,
    /// Floor below which replay consumers forbid garbage collection.
    /// `MAX_KEY_SEQUENCE` means no replay consumer exists.
    pub manual_gc_cutoff: u64,
}

impl<S: Storage + Clone, C: Comparator + 'static> VersionSet<S, C> {
    pub fn new(db_path: String, options: Arc<Options<C>>, env: S) -> Self {
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let table_cache = TableCache::new(db_path.clone(), options.max_open_files, env.clone());
        let max_levels = options.max_levels;
        let first = Arc::new(Version::new(options.clone(), icmp.clone()));
        let mut versions = VecDeque::new();
        versions.push_front(first);
        Self {
            env,
            db_path,
            options,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            log_number: 0,
            prev_log_number: 0,
            last_sequence: 0,
            manifest_writer: None,
            manifest_write_busy: false,
            versions,
            compaction_pointers: vec![InternalKey::default(); max_levels],
            level_locks: vec![false; max_levels],
            snapshots: SnapshotList::default(),
            pending_outputs: HashSet::new(),
            manual_gc_cutoff: MAX_KEY_SEQUENCE,
        }
    }

    #[inline]
    pub fn current(&self) -> Arc<Version<C>> {
        self.versions
            .front()
            .cloned()
            .unwrap_or_else(|| Arc::new(Version::new(self.options.clone(), self.icmp.clone())))
    }

    #[inline]
    pub fn comparator(&self) -> InternalKeyComparator<C> {
        self.icmp.clone()
    }

    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    #[inline]
    pub fn set_last_sequence(&mut self, seq: u64) {
        assert!(seq >= self.last_sequence, "last_sequence going backwards");
        self.last_sequence = seq;
    }

    #[inline]
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    #[inline]
    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    #[inline]
    pub fn manifest_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// Allocates a fresh file number.
    #[inline]
    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Hands back an allocated-but-unused file number.
    #[inline]
    pub fn reuse_file_number(&mut self, number: u64) {
        if number + 1 == self.next_file_number {
            self.next_file_number = number;
        }
    }

    #[inline]
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current().files[level].len()
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.current().files[level])
    }

    pub fn level_summary(&self) -> String {
        self.current().level_summary()
    }

    /// The sequence below which superseded entries are unobservable:
    /// the oldest live snapshot (or `last_sequence` with none), capped
    /// by the replay garbage-collection floor.
    pub fn smallest_snapshot(&self) -> u64 {
        let base = if self.snapshots.is_empty() {
            self.last_sequence
        } else {
            self.snapshots.oldest()
        };
        base.min(self.manual_gc_cutoff)
    }

    // ===== level-pair locks =====

    /// Whether a compaction of the pair `(level, level + 1)` may start.
    pub fn is_level_pair_unlocked(&self, level: usize) -> bool {
        !self.level_locks[level] && !self.level_locks[level + 1]
    }

    /// Locks levels `level` and `level + 1` for one compaction.
    pub fn try_lock_level_pair(&mut self, level: usize) -> bool {
        if self.is_level_pair_unlocked(level) {
            self.level_locks[level] = true;
            self.level_locks[level + 1] = true;
            true
        } else {
            false
        }
    }

    pub fn unlock_level_pair(&mut self, level: usize) {
        assert!(
            self.level_locks[level] && self.level_locks[level + 1],
            "unlocking a level pair ({}, {}) that is not locked",
            level,
            level + 1
        );
        self.level_locks[level] = false;
        self.level_locks[level + 1] = false;
    }

    // ===== commit protocol helpers (driven by the db, which owns the
    // mutex that must be released around the manifest write) =====

    /// Fills the edit's bookkeeping fields from current state.
    pub fn prepare_edit(&mut self, edit: &mut VersionEdit) {
        match edit.log_number {
            Some(n) => assert!(
                n >= self.log_number && n < self.next_file_number,
                "log number {} out of range",
                n
            ),
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);
    }

    /// Builds (but does not install) the version the edit leads to.
    pub fn build_new_version(&mut self, edit: &VersionEdit) -> Version<C> {
        let mut builder = VersionBuilder::new(self.current());
        builder.accumulate(edit, &mut self.compaction_pointers);
        let mut v = builder.apply_to_new(&self.icmp);
        v.finalize();
        v
    }

    /// Opens a fresh manifest file and writes a snapshot of the current
    /// state as its first record.
    pub fn create_manifest(&mut self) -> Result<()> {
        assert!(self.manifest_writer.is_none());
        self.manifest_file_number = self.new_file_number();
        let name = generate_filename(&self.db_path, FileType::Manifest, self.manifest_file_number);
        let file = self.env.create(&name)?;
        let mut writer = Writer::new(file);
        let snapshot = self.write_snapshot();
        let mut record = vec![];
        snapshot.encode_to(&mut record);
        match writer.add_record(&record).and_then(|_| writer.sync()) {
            Ok(()) => {
                self.manifest_writer = Some(writer);
                Ok(())
            }
            Err(e) => {
                let _ = self.env.remove(&name);
                Err(e)
            }
        }
    }

    /// Installs a built version and the edit's counter updates as the
    /// new current state.
    pub fn install_new_version(&mut self, v: Version<C>, edit: &VersionEdit) {
        if let Some(n) = edit.log_number {
            self.log_number = n;
        }
        if let Some(n) = edit.prev_log_number {
            self.prev_log_number = n;
        }
        self.versions.push_front(Arc::new(v));
        self.gc();
    }

    /// Whether `record` was durably appended to the live manifest.
    /// Used to disambiguate a reported write failure.
    pub fn manifest_contains(&self, record: &[u8]) -> bool {
        let name = generate_filename(&self.db_path, FileType::Manifest, self.manifest_file_number);
        let file = match self.env.open(&name) {
            Ok(f) => f,
            Err(_) => return false,
        };
        let mut reader = Reader::new(file, None, true, 0);
        while let Some(r) = reader.read_record() {
            if r == record {
                return true;
            }
        }
        false
    }

    /// Drops the manifest writer after an unrecoverable write failure,
    /// forcing the next commit onto a fresh manifest file.
    pub fn abandon_manifest(&mut self) {
        self.manifest_writer = None;
    }

    /// A full-state edit equivalent to replaying every committed edit.
    fn write_snapshot(&self) -> VersionEdit {
        let mut edit = VersionEdit::new(self.options.max_levels);
        edit.set_comparator_name(self.icmp.user_comparator.name().to_owned());
        for (level, key) in self.compaction_pointers.iter().enumerate() {
            if !key.is_empty() {
                edit.compaction_pointers.push((level, key.clone()));
            }
        }
        let current = self.current();
        for (level, files) in current.files.iter().enumerate() {
            for f in files.iter() {
                edit.add_file(
                    level,
                    f.number,
                    f.file_size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
            }
        }
        edit
    }

    /// Rebuilds the version state from the manifest named by `CURRENT`.
    pub fn recover(&mut self) -> Result<()> {
        let current_name = generate_filename(&self.db_path, FileType::Current, 0);
        let mut contents = vec![];
        self.env
            .open(&current_name)?
            .read_all(&mut contents)?;
        let contents = String::from_utf8(contents)
            .map_err(|_| Error::Corruption("CURRENT is not valid UTF-8".to_owned()))?;
        if !contents.ends_with('\n') {
            return Err(Error::Corruption(
                "CURRENT file does not end with newline".to_owned(),
            ));
        }
        let manifest_path = std::path::Path::new(&self.db_path).join(contents.trim_end());

        let file = self.env.open(&manifest_path)?;
        let reporter = LogReporter::new();
        let mut reader = Reader::new(file, Some(Box::new(reporter.clone())), true, 0);

        let mut builder = VersionBuilder::new(self.current());
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;
        while let Some(record) = reader.read_record() {
            reporter.result()?;
            let mut edit = VersionEdit::new(self.options.max_levels);
            edit.decoded_from(&record)?;
            if let Some(ref name) = edit.comparator_name {
                if name.as_str() != self.icmp.user_comparator.name() {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: db uses {}, option is {}",
                        name,
                        self.icmp.user_comparator.name()
                    )));
                }
            }
            builder.accumulate(&edit, &mut self.compaction_pointers);
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }
        // manifest corruption is always fatal; the manifest is the
        // source of truth for which files exist
        reporter.result()?;

        let next_file_number = next_file_number
            .ok_or_else(|| Error::Corruption("no next-file-number entry in manifest".to_owned()))?;
        let log_number = log_number
            .ok_or_else(|| Error::Corruption("no log-number entry in manifest".to_owned()))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::Corruption("no last-sequence entry in manifest".to_owned()))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.next_file_number = next_file_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);
        let mut v = builder.apply_to_new(&self.icmp);
        v.finalize();
        self.versions.push_front(Arc::new(v));
        self.gc();
        // recovery always starts a fresh manifest on the next commit
        self.manifest_file_number = self.next_file_number;
        self.next_file_number += 1;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.last_sequence = last_sequence;
        Ok(())
    }

    /// Drops versions no reader or compaction pins any more. The
    /// current version always stays.
    pub fn gc(&mut self) {
        let mut first = true;
        self.versions.retain(|v| {
            let keep = first || Arc::strong_count(v) > 1;
            first = false;
            keep
        });
    }

    /// File numbers referenced by any live version plus all in-flight
    /// outputs.
    pub fn live_files(&mut self) -> HashSet<u64> {
        self.gc();
        let mut live: HashSet<u64> = self.pending_outputs.iter().copied().collect();
        for v in self.versions.iter() {
            for files in v.files.iter() {
                for f in files.iter() {
                    live.insert(f.number);
                }
            }
        }
        live
    }

    // ===== compaction picking =====

    /// The best-scored level due for a size compaction whose level
    /// pair is not already being compacted.
    fn best_unlocked_level(&self) -> Option<usize> {
        let current = self.current();
        let mut best: Option<(f64, usize)> = None;
        for (level, &score) in current.compaction_scores.iter().enumerate() {
            if score < 1.0
                || level + 1 >= self.options.max_levels
                || !self.is_level_pair_unlocked(level)
            {
                continue;
            }
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, level));
            }
        }
        best.map(|(_, level)| level)
    }

    /// Whether some unlocked level wants a compaction.
    pub fn needs_compaction(&self) -> bool {
        if self.best_unlocked_level().is_some() {
            return true;
        }
        match self.current().file_to_compact() {
            Some((_, level)) => {
                level + 1 < self.options.max_levels && self.is_level_pair_unlocked(level)
            }
            None => false,
        }
    }

    /// Picks the most urgent compaction: the best unlocked level with
    /// score >= 1 first, a file with an exhausted seek budget second.
    /// Does not take the level-pair lock; the caller does.
    pub fn pick_compaction(&mut self) -> Option<Compaction<S::F, C>> {
        if let Some(level) = self.best_unlocked_level() {
            if let Some(c) = self.pick_compaction_at_level(level, CompactionReason::MaxSize) {
                return Some(c);
            }
        }
        let current = self.current();
        if let Some((file, level)) = current.file_to_compact() {
            if level + 1 < self.options.max_levels && self.is_level_pair_unlocked(level) {
                let mut c = Compaction::new(self.options.clone(), level, CompactionReason::Seek);
                c.inputs[0] = vec![file];
                c.input_version = Some(current);
                return Some(self.setup_other_inputs(c));
            }
        }
        None
    }

    /// The ratio-driven picker for one level.
    ///
    /// Level 0 merges the oldest files wholesale. Deeper levels
    /// enumerate contiguous runs of files and choose the run moving
    /// the most bytes per byte rewritten in the next level; a file
    /// with no next-level overlap short-circuits as a trivial move.
    pub fn pick_compaction_at_level(
        &mut self,
        level: usize,
        reason: CompactionReason,
    ) -> Option<Compaction<S::F, C>> {
        assert!(level + 1 < self.options.max_levels);
        let current = self.current();
        let files = current.level_files(level);
        if files.is_empty() {
            return None;
        }
        let mut c = Compaction::new(self.options.clone(), level, reason);
        if level == 0 {
            // oldest files first; level 0 is kept in file-number order
            c.inputs[0] = files
                .iter()
                .take(self.options.max_l0_compaction_files)
                .cloned()
                .collect();
        } else {
            let budget = self.options.expanded_compaction_byte_size_limit();
            let mut best: Option<(f64, u64, usize, usize)> = None; // ratio, total, i, j
            for i in 0..files.len() {
                let mut run_bytes = 0u64;
                for j in i..files.len() {
                    run_bytes += files[j].file_size;
                    let overlaps = current.get_overlapping_inputs(
                        level + 1,
                        Some(&files[i].smallest),
                        Some(&files[j].largest),
                    );
                    let overlap_bytes = total_file_size(&overlaps);
                    if j == i && overlap_bytes == 0 {
                        // a free move beats any merge
                        c.inputs[0] = vec![files[i].clone()];
                        c.input_version = Some(current.clone());
                        return Some(self.setup_other_inputs(c));
                    }
                    let total = run_bytes + overlap_bytes;
                    if total > budget && j > i {
                        break;
                    }
                    let ratio = run_bytes as f64 / overlap_bytes as f64;
                    let better = match best {
                        None => true,
                        Some((best_ratio, best_total, _, _)) => {
                            ratio > best_ratio || (ratio == best_ratio && total < best_total)
                        }
                    };
                    if better {
                        best = Some((ratio, total, i, j));
                    }
                }
            }
            let (_, _, i, j) = best?;
            let run_bytes = total_file_size(&files[i..=j]);
            let level_bytes = total_file_size(files);
            let next_bytes = total_file_size(current.level_files(level + 1));
            if level_bytes - run_bytes > next_bytes {
                // one run barely dents this level; take it whole rather
                // than grinding through many small merges
                c.inputs[0] = files.to_vec();
            } else {
                c.inputs[0] = files[i..=j].to_vec();
            }
        }
        c.input_version = Some(current);
        Some(self.setup_other_inputs(c))
    }

    /// Plans one pass of a manual compaction over the files at
    /// `manual.level` overlapping `[manual.begin, manual.end]`.
    /// Returns `None` when nothing overlaps. Clears `manual.done` when
    /// the pass was truncated; the caller resumes from the last input
    /// key until the range is exhausted.
    pub fn compact_range(
        &mut self,
        manual: &mut ManualCompaction,
    ) -> Option<Compaction<S::F, C>> {
        let level = manual.level;
        assert!(level + 1 < self.options.max_levels);
        let current = self.current();
        let mut overlapping =
            current.get_overlapping_inputs(level, manual.begin.as_ref(), manual.end.as_ref());
        if overlapping.is_empty() {
            manual.done = true;
            return None;
        }
        manual.done = true;
        // Past level 0, bound one pass to roughly one output file of
        // input. Level 0 cannot be truncated this way since its files
        // overlap each other.
        if level > 0 {
            let limit = self.options.max_file_size as u64;
            let mut total = 0u64;
            for (i, f) in overlapping.iter().enumerate() {
                total += f.file_size;
                if total >= limit && i + 1 < overlapping.len() {
                    overlapping.truncate(i + 1);
                    manual.done = false;
                    break;
                }
            }
        }
        let mut c = Compaction::new(self.options.clone(), level, CompactionReason::Manual);
        c.inputs[0] = overlapping;
        c.input_version = Some(current);
        Some(self.setup_other_inputs(c))
    }

    /// Completes a compaction plan: pulls in boundary files, computes
    /// the exact next-level overlap, optionally grows the base set
    /// while that overlap stays fixed, collects grandparents and
    /// advances the level's compaction pointer.
    fn setup_other_inputs(&mut self, mut c: Compaction<S::F, C>) -> Compaction<S::F, C> {
        let current = match &c.input_version {
            Some(v) => v.clone(),
            None => self.current(),
        };
        let level = c.level;
        add_boundary_inputs(&self.icmp, current.level_files(level), &mut c.inputs[0]);
        let (smallest, largest) = c.base_range(&self.icmp);
        c.inputs[1] = current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(&self.icmp, current.level_files(level + 1), &mut c.inputs[1]);
        let (mut all_smallest, mut all_largest) = c.total_range(&self.icmp);

        if !c.inputs[1].is_empty() {
            // See whether more base-level files fit under the same
            // next-level overlap.
            let mut expanded0 =
                current.get_overlapping_inputs(level, Some(&all_smallest), Some(&all_largest));
            add_boundary_inputs(&self.icmp, current.level_files(level), &mut expanded0);
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < self.options.expanded_compaction_byte_size_limit()
            {
                let (new_start, new_limit) = key_range(&self.icmp, &expanded0);
                let mut expanded1 = current.get_overlapping_inputs(
                    level + 1,
                    Some(&new_start),
                    Some(&new_limit),
                );
                add_boundary_inputs(&self.icmp, current.level_files(level + 1), &mut expanded1);
                if expanded1.len() == c.inputs[1].len() {
                    info!(
                        "expanding@{} {}+{} ({}+{} bytes) to {}+{} ({}+{} bytes)",
                        level,
                        c.inputs[0].len(),
                        c.inputs[1].len(),
                        total_file_size(&c.inputs[0]),
                        inputs1_size,
                        expanded0.len(),
                        expanded1.len(),
                        expanded0_size,
                        total_file_size(&expanded1),
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let range = c.total_range(&self.icmp);
                    all_smallest = range.0;
                    all_largest = range.1;
                }
            }
        }

        if level + 2 < self.options.max_levels {
            c.grandparents = current.get_overlapping_inputs(
                level + 2,
                Some(&all_smallest),
                Some(&all_largest),
            );
        }

        // Remember the end of this selection so repeated compactions
        // at the level walk round-robin through the keyspace.
        let (_, base_largest) = c.base_range(&self.icmp);
        self.compaction_pointers[level] = base_largest.clone();
        c.edit
            .compaction_pointers
            .push((level, base_largest));
        c
    }

    /// Total file counts per level, for stats properties.
    pub fn level_file_counts(&self) -> Vec<usize> {
        self.current().files.iter().map(|f| f.len()).collect()
    }

    /// Per-table-file summary of the current version.
    pub fn sstable_summary(&self) -> String {
        let mut s = String::new();
        for (level, files) in self.current().files.iter().enumerate() {
            for f in files.iter() {
                s.push_str(&format!(
                    "level {}: {} (size {}) [{:?} .. {:?}]\n",
                    level, f.number, f.file_size, f.smallest, f.largest
                ));
            }
        }
        s
    }
}

/// Extends `compact_files` with the level files needed to keep every
/// user key's versions together: if the largest key of the selection
/// has a sibling entry (same user key, older sequence) starting another
/// file, that file must compact too, or a later read could surface the
/// older version from the level left behind.
pub fn add_boundary_inputs<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    level_files: &[Arc<FileMetaData>],
    compact_files: &mut Vec<Arc<FileMetaData>>,
) {
    if let Some(mut largest_key) = find_largest_key(icmp, compact_files) {
        while let Some(smallest_boundary_file) =
            find_smallest_boundary_file(icmp, level_files, &largest_key)
        {
            largest_key = smallest_boundary_file.largest.clone();
            compact_files.push(smallest_boundary_file);
        }
    }
}

fn find_largest_key<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    files: &[Arc<FileMetaData>],
) -> Option<InternalKey> {
    let mut largest: Option<&InternalKey> = None;
    for f in files.iter() {
        match largest {
            Some(l) if icmp.compare(f.largest.data(), l.data()) != CmpOrdering::Greater => {}
            _ => largest = Some(&f.largest),
        }
    }
    largest.cloned()
}

// the file whose smallest key is the least key greater than
// `largest_key` but for the same user key
fn find_smallest_boundary_file<C: Comparator>(
    icmp: &InternalKeyComparator<C>,
    level_files: &[Arc<FileMetaData>],
    largest_key: &InternalKey,
) -> Option<Arc<FileMetaData>> {
    let ucmp = &icmp.user_comparator;
    let mut smallest_boundary_file: Option<&Arc<FileMetaData>> = None;
    for f in level_files.iter() {
        if icmp.compare(f.smallest.data(), largest_key.data()) == CmpOrdering::Greater
            && ucmp.compare(f.smallest.user_key(), largest_key.user_key()) == CmpOrdering::Equal
        {
            match smallest_boundary_file {
                Some(b)
                    if icmp.compare(f.smallest.data(), b.smallest.data())
                        != CmpOrdering::Less => {}
                _ => smallest_boundary_file = Some(f),
            }
        }
    }
    smallest_boundary_file.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format::ValueType;
    use crate::storage::mem::MemStorage;
    use crate::util::comparator::BytewiseComparator;

    fn icmp() -> InternalKeyComparator<BytewiseComparator> {
        InternalKeyComparator::new(BytewiseComparator)
    }

    fn ikey(ukey: &str, seq: u64) -> InternalKey {
        InternalKey::new(ukey.as_bytes(), seq, ValueType::Value)
    }

    fn meta(number: u64, size: u64, smallest: InternalKey, largest: InternalKey) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(number, size, smallest, largest))
    }

    fn new_set() -> VersionSet<MemStorage, BytewiseComparator> {
        let env = MemStorage::default();
        env.mkdir_all("/db").unwrap();
        VersionSet::new("/db".to_owned(), Arc::new(Options::default()), env)
    }

    fn apply(set: &mut VersionSet<MemStorage, BytewiseComparator>, edit: &VersionEdit) {
        let v = set.build_new_version(edit);
        set.install_new_version(v, edit);
    }

    fn add_edit(files: Vec<(usize, u64, u64, &str, &str)>) -> VersionEdit {
        let mut edit = VersionEdit::new(7);
        for (level, number, size, s, l) in files {
            edit.add_file(level, number, size, ikey(s, 100), ikey(l, 90));
        }
        edit
    }

    #[test]
    fn test_builder_add_and_delete() {
        let mut set = new_set();
        apply(
            &mut set,
            &add_edit(vec![(1, 5, 100, "a", "c"), (1, 6, 100, "e", "g")]),
        );
        assert_eq!(set.num_level_files(1), 2);
        let mut edit = VersionEdit::new(7);
        edit.delete_file(1, 5);
        edit.add_file(1, 7, 100, ikey("h", 80), ikey("k", 70));
        apply(&mut set, &edit);
        let current = set.current();
        let numbers: Vec<u64> = current.files[1].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![6, 7]);
        assert_eq!(set.num_level_bytes(1), 200);
    }

    #[test]
    fn test_builder_orders_level0_by_number() {
        let mut set = new_set();
        apply(
            &mut set,
            &add_edit(vec![(0, 9, 100, "a", "z"), (0, 4, 100, "b", "y")]),
        );
        let current = set.current();
        let numbers: Vec<u64> = current.files[0].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![4, 9]);
    }

    #[test]
    #[should_panic]
    fn test_builder_rejects_overlap_past_level0() {
        let mut set = new_set();
        apply(
            &mut set,
            &add_edit(vec![(1, 5, 100, "a", "f"), (1, 6, 100, "c", "k")]),
        );
    }

    #[test]
    fn test_commit_and_recover_round_trip() {
        let env = MemStorage::default();
        env.mkdir_all("/db").unwrap();
        let mut set: VersionSet<MemStorage, BytewiseComparator> =
            VersionSet::new("/db".to_owned(), Arc::new(Options::default()), env.clone());
        // commit two edits through a real manifest
        set.create_manifest().unwrap();
        crate::db::filename::update_current(&env, "/db", set.manifest_number()).unwrap();
        set.set_last_sequence(42);
        for edit_files in [
            vec![(1usize, 5u64, 100u64, "a", "c")],
            vec![(2, 6, 200, "d", "f")],
        ] {
            let mut edit = add_edit(edit_files);
            set.prepare_edit(&mut edit);
            let v = set.build_new_version(&edit);
            let mut record = vec![];
            edit.encode_to(&mut record);
            if let Some(w) = set.manifest_writer.as_mut() {
                w.add_record(&record).unwrap();
                w.sync().unwrap();
            }
            set.install_new_version(v, &edit);
            assert!(set.manifest_contains(&record));
        }

        let mut recovered: VersionSet<MemStorage, BytewiseComparator> =
            VersionSet::new("/db".to_owned(), Arc::new(Options::default()), env);
        recovered.recover().unwrap();
        assert_eq!(recovered.num_level_files(1), 1);
        assert_eq!(recovered.num_level_files(2), 1);
        assert_eq!(recovered.last_sequence(), 42);
        // the next commit gets a fresh manifest number
        assert!(recovered.manifest_number() > set.manifest_number());
    }

    #[test]
    fn test_recover_without_current_fails() {
        let mut set = new_set();
        assert!(set.recover().is_err());
    }

    #[test]
    fn test_level_pair_locks() {
        let mut set = new_set();
        assert!(set.try_lock_level_pair(1));
        assert!(!set.try_lock_level_pair(1));
        assert!(!set.try_lock_level_pair(0)); // shares level 1
        assert!(!set.try_lock_level_pair(2)); // shares level 2
        assert!(set.try_lock_level_pair(3));
        set.unlock_level_pair(1);
        assert!(set.try_lock_level_pair(0));
    }

    #[test]
    fn test_pick_compaction_level0() {
        let mut set = new_set();
        let mut files = vec![];
        for n in 1..=5u64 {
            files.push((0, n, 1000, "a", "z"));
        }
        apply(&mut set, &add_edit(files));
        assert!(set.needs_compaction());
        let c = set.pick_compaction().unwrap();
        assert_eq!(c.level, 0);
        assert_eq!(c.reason, CompactionReason::MaxSize);
        // all five files selected, oldest first
        let numbers: Vec<u64> = c.inputs[0].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_pick_compaction_prefers_trivial_move() {
        let mut set = new_set();
        // level 1 heavily oversized so it gets picked; file 8 has no
        // overlap below
        let max = Options::<BytewiseComparator>::default().l1_max_bytes;
        apply(
            &mut set,
            &add_edit(vec![
                (1, 7, max, "a", "c"),
                (1, 8, max, "p", "r"),
                (2, 9, 100, "a", "d"),
            ]),
        );
        let c = set.pick_compaction().unwrap();
        assert_eq!(c.level, 1);
        assert_eq!(c.inputs[0].len(), 1);
        assert_eq!(c.inputs[0][0].number, 8);
        assert!(c.inputs[1].is_empty());
        assert!(c.is_trivial_move());
    }

    #[test]
    fn test_pick_compaction_best_ratio_run() {
        let mut set = new_set();
        let max = Options::<BytewiseComparator>::default().l1_max_bytes;
        // file 5 overlaps 100 bytes below, file 6 overlaps 200MB; the
        // heavy level 2 also keeps the whole-level takeover away
        apply(
            &mut set,
            &add_edit(vec![
                (1, 5, max, "a", "c"),
                (1, 6, max, "h", "k"),
                (2, 7, 100, "a", "d"),
                (2, 8, 200 * 1024 * 1024, "h", "l"),
            ]),
        );
        let c = set.pick_compaction().unwrap();
        assert_eq!(c.level, 1);
        let numbers: Vec<u64> = c.inputs[0].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![5]);
        assert_eq!(c.inputs[1].len(), 1);
        assert_eq!(c.inputs[1][0].number, 7);
    }

    #[test]
    fn test_pick_compaction_whole_level_takeover() {
        let mut set = new_set();
        let max = Options::<BytewiseComparator>::default().l1_max_bytes;
        // level 1 dwarfs level 2, so one run would barely dent it
        apply(
            &mut set,
            &add_edit(vec![
                (1, 5, max, "a", "c"),
                (1, 6, max, "h", "k"),
                (2, 7, 100, "a", "d"),
                (2, 8, 100, "h", "l"),
            ]),
        );
        let c = set.pick_compaction().unwrap();
        assert_eq!(c.level, 1);
        let numbers: Vec<u64> = c.inputs[0].iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![5, 6]);
        assert_eq!(c.inputs[1].len(), 2);
    }

    #[test]
    fn test_pick_compaction_seek_fallback() {
        let mut set = new_set();
        apply(
            &mut set,
            &add_edit(vec![(1, 5, 100, "a", "c"), (2, 6, 100, "b", "d")]),
        );
        let current = set.current();
        assert!(!set.needs_compaction());
        let f = current.files[1][0].clone();
        f.allowed_seeks.store(1, std::sync::atomic::Ordering::Release);
        assert!(current.update_stats(Some((f, 1))));
        assert!(set.needs_compaction());
        let c = set.pick_compaction().unwrap();
        assert_eq!(c.reason, CompactionReason::Seek);
        assert_eq!(c.inputs[0][0].number, 5);
        assert_eq!(c.inputs[1][0].number, 6);
    }

    #[test]
    fn test_pick_compaction_skips_locked_levels() {
        let mut set = new_set();
        let max = Options::<BytewiseComparator>::default().l1_max_bytes;
        // levels 1 and 3 are both over budget; 1 scores higher
        apply(
            &mut set,
            &add_edit(vec![
                (1, 5, 4 * max, "a", "c"),
                (2, 6, 100, "p", "r"),
                (3, 7, 2 * max * 100, "e", "g"),
            ]),
        );
        let c = set.pick_compaction().unwrap();
        assert_eq!(c.level, 1);
        drop(c);

        // with the (1, 2) pair held, the next-best level still shows
        assert!(set.try_lock_level_pair(1));
        assert!(set.needs_compaction());
        let c = set.pick_compaction().unwrap();
        assert_eq!(c.level, 3);
        drop(c);

        // with both pairs held nothing is left to pick
        assert!(set.try_lock_level_pair(3));
        assert!(!set.needs_compaction());
        assert!(set.pick_compaction().is_none());
        set.unlock_level_pair(1);
        set.unlock_level_pair(3);
    }

    #[test]
    fn test_compact_range_truncates_and_resumes() {
        let mut set = new_set();
        let big = Options::<BytewiseComparator>::default().max_file_size as u64;
        apply(
            &mut set,
            &add_edit(vec![
                (1, 5, big, "a", "c"),
                (1, 6, big, "e", "g"),
                (1, 7, big, "i", "k"),
            ]),
        );
        let mut manual = ManualCompaction {
            level: 1,
            done: false,
            begin: None,
            end: None,
        };
        let c = set.compact_range(&mut manual).unwrap();
        assert_eq!(c.reason, CompactionReason::Manual);
        assert_eq!(c.inputs[0].len(), 1);
        assert_eq!(c.inputs[0][0].number, 5);
        // truncated, so the range is not exhausted yet
        assert!(!manual.done);

        // resuming past the remaining middle file leaves one pass
        manual.begin = Some(InternalKey::new(b"h", 100, ValueType::Value));
        let c = set.compact_range(&mut manual).unwrap();
        assert_eq!(c.inputs[0][0].number, 7);
        assert!(manual.done);

        let mut empty = ManualCompaction {
            level: 3,
            done: false,
            begin: None,
            end: None,
        };
        assert!(set.compact_range(&mut empty).is_none());
        assert!(empty.done);
    }

    #[test]
    fn test_compaction_pointer_advances() {
        let mut set = new_set();
        let max = Options::<BytewiseComparator>::default().l1_max_bytes;
        apply(&mut set, &add_edit(vec![(1, 5, 2 * max, "a", "c")]));
        let c = set.pick_compaction().unwrap();
        assert_eq!(
            c.edit.compaction_pointers[0].1.user_key(),
            b"c"
        );
        assert_eq!(set.compaction_pointers[1].user_key(), b"c");
    }

    #[test]
    fn test_add_boundary_inputs() {
        let c = icmp();
        // file 2 starts with an older version of file 1's largest user
        // key; compacting 1 alone would leave "m"@50 behind at this
        // level while "m"@100 moves down
        let f1 = meta(1, 100, ikey("a", 100), ikey("m", 100));
        let f2 = meta(2, 100, InternalKey::new(b"m", 50, ValueType::Value), ikey("r", 40));
        let f3 = meta(3, 100, ikey("s", 30), ikey("z", 20));
        let level_files = vec![f1.clone(), f2.clone(), f3];
        let mut compact_files = vec![f1];
        add_boundary_inputs(&c, &level_files, &mut compact_files);
        let numbers: Vec<u64> = compact_files.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        // no boundary file, nothing added
        let mut compact_files = vec![level_files[2].clone()];
        add_boundary_inputs(&c, &level_files, &mut compact_files);
        assert_eq!(compact_files.len(), 1);
        // empty selection is a no-op
        let mut empty = vec![];
        add_boundary_inputs(&c, &level_files, &mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_add_boundary_inputs_chains() {
        let c = icmp();
        let f1 = meta(1, 100, ikey("a", 100), ikey("m", 100));
        let f2 = meta(
            2,
            100,
            InternalKey::new(b"m", 50, ValueType::Value),
            InternalKey::new(b"m", 40, ValueType::Value),
        );
        let f3 = meta(3, 100, InternalKey::new(b"m", 30, ValueType::Value), ikey("z", 20));
        let level_files = vec![f1.clone(), f2, f3];
        let mut compact_files = vec![f1];
        add_boundary_inputs(&c, &level_files, &mut compact_files);
        let numbers: Vec<u64> = compact_files.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_smallest_snapshot() {
        let mut set = new_set();
        set.set_last_sequence(100);
        assert_eq!(set.smallest_snapshot(), 100);
        let s = set.snapshots.acquire(60);
        assert_eq!(set.smallest_snapshot(), 60);
        set.manual_gc_cutoff = 40;
        assert_eq!(set.smallest_snapshot(), 40);
        assert!(set.snapshots.release(s));
        set.manual_gc_cutoff = MAX_KEY_SEQUENCE;
        assert_eq!(set.smallest_snapshot(), 100);
    }

    #[test]
    fn test_file_number_allocation() {
        let mut set = new_set();
        let a = set.new_file_number();
        let b = set.new_file_number();
        assert_eq!(b, a + 1);
        set.reuse_file_number(b);
        assert_eq!(set.new_file_number(), b);
        set.mark_file_number_used(100);
        assert_eq!(set.new_file_number(), 101);
    }

    #[test]
    fn test_gc_and_live_files() {
        let mut set = new_set();
        apply(&mut set, &add_edit(vec![(1, 5, 100, "a", "c")]));
        let pinned = set.current();
        let mut edit = VersionEdit::new(7);
        edit.delete_file(1, 5);
        edit.add_file(1, 9, 100, ikey("a", 80), ikey("c", 70));
        apply(&mut set, &edit);
        // file 5 stays live while the old version is pinned
        let live = set.live_files();
        assert!(live.contains(&5));
        assert!(live.contains(&9));
        drop(pinned);
        let live = set.live_files();
        assert!(!live.contains(&5));
        assert!(live.contains(&9));
        // in-flight outputs count as live
        set.pending_outputs.insert(77);
        assert!(set.live_files().contains(&77));
    }
}
