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

use crate::logger::Logger;
use crate::snapshot::Snapshot;
use crate::storage::Storage;
use crate::util::comparator::Comparator;
use log::LevelFilter;
use std::sync::Arc;

/// Options controlling db behavior. `C` is the user key comparator.
#[derive(Clone)]
pub struct Options<C: Comparator> {
    /// Comparator used to define the order of user keys.
    ///
    /// The client must ensure that the comparator supplied here has the
    /// same name and orders keys exactly the same as the comparator
    /// provided to previous open calls on the same db.
    pub comparator: C,

    /// If true, the db will be created if it is missing.
    pub create_if_missing: bool,

    /// If true, an error is raised if the db already exists.
    pub error_if_exists: bool,

    /// If true, the implementation does aggressive checking of the data
    /// it is processing and stops early if it detects any errors.
    pub paranoid_checks: bool,

    /// A logger used for db runtime info. When `None`, one is created
    /// writing to the db directory (release) or terminal (debug).
    pub logger: Option<slog::Logger>,

    /// The maximum log level to emit.
    pub logger_level: LevelFilter,

    /// Amount of data to build up in memory (backed by the write-ahead
    /// log) before flushing to a sorted on-disk file.
    pub write_buffer_size: usize,

    /// Number of open table files that can be cached.
    pub max_open_files: usize,

    /// Compaction outputs are cut when they grow past this size.
    pub max_file_size: usize,

    /// Maximum number of levels.
    pub max_levels: usize,

    /// Number of level-0 files at which a level-0 compaction becomes
    /// eligible.
    pub l0_compaction_threshold: usize,

    /// Soft limit on the number of level-0 files. Writes are slowed
    /// down when this is hit.
    pub l0_slowdown_writes_threshold: usize,

    /// Hard limit on the number of level-0 files. Writes stall when
    /// this is hit.
    pub l0_stop_writes_threshold: usize,

    /// The maximum total byte size of level 1. Every deeper level may
    /// hold ten times its parent.
    pub l1_max_bytes: u64,

    /// Number of bytes an iterator may read before triggering a seek
    /// stats sample.
    pub read_bytes_period: u64,

    /// An optimistic background compaction runs only when the ratio of
    /// bytes moved out of a level to bytes overlapped in the next level
    /// is better than this threshold (or when the move is trivial).
    pub optimistic_ratio_threshold: f64,

    /// The maximum number of level-0 files merged by one compaction.
    pub max_l0_compaction_files: usize,
}

impl<C: Comparator> Options<C> {
    /// Maximum bytes of overlap with level+2 before an output file is
    /// cut.
    pub fn max_grandparent_overlap_bytes(&self) -> u64 {
        10 * self.max_file_size as u64
    }

    /// Cap on the total size of an expanded compaction.
    pub fn expanded_compaction_byte_size_limit(&self) -> u64 {
        25 * self.max_file_size as u64
    }

    /// Maximum total bytes for the given level. Level 0 is governed by
    /// file count, not bytes.
    pub fn max_bytes_for_level(&self, mut level: usize) -> u64 {
        let mut result = self.l1_max_bytes;
        while level > 1 {
            result *= 10;
            level -= 1;
        }
        result
    }

    /// Finishes option setup: clips odd values into sane ranges and
    /// installs the global logger.
    pub(crate) fn initialize<S: Storage>(&mut self, db_path: &str, env: &S) {
        self.max_levels = self.max_levels.clamp(3, 12);
        self.max_open_files = self.max_open_files.clamp(64, 50_000);
        self.write_buffer_size = self.write_buffer_size.clamp(64 << 10, 1 << 30);
        self.max_file_size = self.max_file_size.clamp(1 << 20, 1 << 30);
        if self.optimistic_ratio_threshold <= 0.0 {
            self.optimistic_ratio_threshold = 0.90;
        }
        if self.max_l0_compaction_files == 0 {
            self.max_l0_compaction_files = 32;
        }
        let logger = Logger::new(self.logger.take(), self.logger_level, env, db_path);
        Logger::apply(logger);
    }
}

impl<C: Comparator> Default for Options<C> {
    fn default() -> Self {
        Self {
            comparator: C::default(),
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            logger: None,
            logger_level: LevelFilter::Info,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 500,
            max_file_size: 2 * 1024 * 1024,
            max_levels: 7,
            l0_compaction_threshold: 4,
            l0_slowdown_writes_threshold: 8,
            l0_stop_writes_threshold: 12,
            l1_max_bytes: 64 * 1024 * 1024,
            read_bytes_period: 1_048_576,
            optimistic_ratio_threshold: 0.90,
            max_l0_compaction_files: 32,
        }
    }
}

/// Options for read operations.
#[derive(Clone)]
pub struct ReadOptions {
    /// Verify checksums of everything read from the underlying storage.
    pub verify_checksums: bool,

    /// Whether data read for this iteration should be cached in memory.
    pub fill_cache: bool,

    /// Read as of the given snapshot instead of the latest state.
    pub snapshot: Option<Arc<Snapshot>>,
}

impl ReadOptions {
    pub fn with_snapshot(snapshot: Arc<Snapshot>) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Default::default()
        }
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

/// Options for write operations.
#[derive(Clone)]
pub struct WriteOptions {
    /// If true, the write is flushed from the operating system buffer
    /// cache before it is considered complete. Crash-durable, slower.
    pub sync: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { sync: false }
    }
}
