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

pub mod filename;
pub mod format;
pub mod iterator;

use crate::batch::{WriteBatch, HEADER_SIZE as BATCH_HEADER_SIZE};
use crate::compaction::{Compaction, CompactionStats, ManualCompaction};
use crate::db::filename::{generate_filename, parse_filename, update_current, FileType};
use crate::db::format::{
    InternalKey, InternalKeyComparator, LookupKey, MAX_KEY_SEQUENCE, VALUE_TYPE_FOR_SEEK,
};
use crate::db::iterator::{DBIterator, ReplayIterator, SiltDBIterator, SiltReplayIterator};
use crate::iterator::{ConcatenateIterator, Iterator, MergingIterator};
use crate::mem::MemTable;
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::record::reader::Reader;
use crate::record::writer::Writer;
use crate::snapshot::Snapshot;
use crate::sstable::table::TableBuilder;
use crate::storage::{File, Storage};
use crate::table_cache::TableCache;
use crate::util::comparator::Comparator;
use crate::util::reporter::LogReporter;
use crate::version::version_edit::{FileMetaData, VersionEdit};
use crate::version::version_set::VersionSet;
use crate::version::{FileIterFactory, LevelFileNumIterator};
use crate::{Error, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use crossbeam_utils::sync::ShardedLock;
use log::{error, info, warn};
use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// An ordered map from byte-string keys to byte-string values, durable
/// across crashes.
pub trait DB {
    type Iterator;
    type ReplayIterator;

    /// `put` sets the value for the given key. It overwrites any
    /// previous value for that key.
    fn put(&self, options: WriteOptions, key: &[u8], value: &[u8]) -> Result<()>;

    /// `delete` removes the value for the given key. It is not an error
    /// if the key does not exist.
    fn delete(&self, options: WriteOptions, key: &[u8]) -> Result<()>;

    /// `write` applies the operations contained in the batch
    /// atomically. An empty batch blocks until the current memtable has
    /// been flushed instead.
    fn write(&self, options: WriteOptions, batch: WriteBatch) -> Result<()>;

    /// `get` returns the value for the given key, or `None` if the key
    /// is absent or deleted.
    fn get(&self, options: ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// An iterator over the live user keys in ascending order.
    fn iter(&self, options: ReadOptions) -> Result<Self::Iterator>;

    /// Pins the current state. Reads through the snapshot ignore all
    /// later writes until it is released.
    fn snapshot(&self) -> Arc<Snapshot>;

    fn release_snapshot(&self, snapshot: Arc<Snapshot>);

    /// Compacts the key range `[begin, end]` all the way down the
    /// tree. `None` stands for "before all keys" / "after all keys".
    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()>;

    /// For each `[start, limit)` range, the approximate file bytes the
    /// range occupies.
    fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64>;

    /// Implementation-specific state, queried by name. Recognized
    /// names start with `silt.`.
    fn get_property(&self, name: &str) -> Option<String>;

    /// Writes a consistent, openable copy of the db into `dir`.
    fn backup(&self, dir: &str) -> Result<()>;

    /// An opaque timestamp naming "everything written so far".
    fn get_replay_timestamp(&self) -> String;

    /// Iterates every write at or after `timestamp` in key order. The
    /// timestamps `"all"` and `"now"` are always valid.
    fn get_replay_iterator(&self, timestamp: &str) -> Result<Self::ReplayIterator>;

    /// Tells the db no replay iterator will ever be requested for a
    /// timestamp before the given one, unlocking garbage collection of
    /// the history below it.
    fn allow_garbage_collect_before_timestamp(&self, timestamp: &str) -> Result<()>;

    /// Stops background work and releases the db directory lock. The
    /// write-ahead log is synced so nothing acknowledged is lost.
    fn close(&mut self) -> Result<()>;

    /// Closes the db and removes every file it created.
    fn destroy(&mut self) -> Result<()>;
}

/// The handle users hold: an `Arc` around the engine plus the
/// background workers driving flushes and compactions.
pub struct SiltDB<S: Storage + Clone + 'static, C: Comparator + 'static> {
    inner: Arc<DBImpl<S, C>>,
    shutdown_acks: Arc<Mutex<Vec<Receiver<()>>>>,
}

impl<S: Storage + Clone + 'static, C: Comparator + 'static> Clone for SiltDB<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shutdown_acks: self.shutdown_acks.clone(),
        }
    }
}

impl<S: Storage + Clone + 'static, C: Comparator + 'static> SiltDB<S, C> {
    /// Opens (creating if allowed and necessary) the db at `db_path`,
    /// recovers its state and starts the background workers.
    pub fn open_db(mut options: Options<C>, db_path: &str, env: S) -> Result<Self> {
        env.mkdir_all(db_path)?;
        options.initialize(db_path, &env);
        let mut db = DBImpl::new(Arc::new(options), db_path, env.clone());
        let lock_file = env.create(generate_filename(db_path, FileType::Lock, 0))?;
        lock_file.lock()?;
        *db.db_lock.lock().unwrap() = Some(lock_file);
        db.recover_db()?;
        let silt = Self {
            inner: Arc::new(db),
            shutdown_acks: Arc::new(Mutex::new(vec![])),
        };
        silt.spawn_flush_worker();
        silt.spawn_compaction_worker();
        silt.spawn_optimistic_worker();
        silt.inner
            .background_activity_allowed
            .store(true, Ordering::Release);
        // recovery may have left compaction debt behind
        silt.inner.trigger_compaction();
        Ok(silt)
    }

    /// Drains the immutable memtable whenever one appears. Failures are
    /// logged and retried on a fixed backoff; the memtable stays queued
    /// so no acknowledged write can be lost.
    fn spawn_flush_worker(&self) {
        let db = self.inner.clone();
        let rx = db.do_flush.1.clone();
        let (ack_tx, ack_rx) = bounded(1);
        self.shutdown_acks.lock().unwrap().push(ack_rx);
        thread::spawn(move || {
            while rx.recv().is_ok() {
                if db.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                if !db.background_activity_allowed.load(Ordering::Acquire) {
                    continue;
                }
                while db.im_mem.read().unwrap().is_some() {
                    if db.shutting_down.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = db.compact_mem_table() {
                        error!("memtable flush failed (will retry): {}", e);
                        thread::sleep(FLUSH_RETRY_BACKOFF);
                    }
                }
                // a flush can push level 0 over its threshold
                db.trigger_compaction();
            }
            let _ = ack_tx.send(());
        });
    }

    /// Runs manual, size-triggered and seek-triggered compactions.
    /// Errors back off exponentially: 1s, 2s, 4s, then 8s per retry.
    fn spawn_compaction_worker(&self) {
        let db = self.inner.clone();
        let rx = db.do_compaction.1.clone();
        let (ack_tx, ack_rx) = bounded(1);
        self.shutdown_acks.lock().unwrap().push(ack_rx);
        thread::spawn(move || {
            let mut backoff = Duration::from_secs(1);
            while rx.recv().is_ok() {
                if db.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                if !db.background_activity_allowed.load(Ordering::Acquire) {
                    continue;
                }
                loop {
                    match db.background_compaction() {
                        Ok(()) => backoff = Duration::from_secs(1),
                        Err(e) => {
                            error!("compaction failed (will retry): {}", e);
                            thread::sleep(backoff);
                            backoff = (backoff * 2).min(Duration::from_secs(8));
                        }
                    }
                    if db.shutting_down.load(Ordering::Acquire) {
                        break;
                    }
                    let more = {
                        let versions = db.versions.lock().unwrap();
                        versions.needs_compaction()
                            || !db.manual_compaction_queue.lock().unwrap().is_empty()
                    };
                    if !more {
                        break;
                    }
                }
                let _ = db.do_optimistic.0.send(());
            }
            let _ = ack_tx.send(());
        });
    }

    /// Sweeps the middle levels for merges cheap enough to do ahead of
    /// time. Failures retry on a fixed one second backoff.
    fn spawn_optimistic_worker(&self) {
        let db = self.inner.clone();
        let rx = db.do_optimistic.1.clone();
        let (ack_tx, ack_rx) = bounded(1);
        self.shutdown_acks.lock().unwrap().push(ack_rx);
        thread::spawn(move || {
            while rx.recv().is_ok() {
                if db.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                if !db.background_activity_allowed.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(e) = db.optimistic_compaction() {
                    error!("optimistic compaction failed (will retry): {}", e);
                    thread::sleep(Duration::from_secs(1));
                }
            }
            let _ = ack_tx.send(());
        });
    }
}

impl<S: Storage + Clone + 'static, C: Comparator + 'static> DB for SiltDB<S, C> {
    type Iterator = SiltDBIterator<S, C>;
    type ReplayIterator = SiltReplayIterator<C>;

    fn put(&self, options: WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.inner.write_impl(options, batch)
    }

    fn delete(&self, options: WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.inner.write_impl(options, batch)
    }

    fn write(&self, options: WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write_impl(options, batch)
    }

    fn get(&self, options: ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get_impl(&options, key)
    }

    fn iter(&self, options: ReadOptions) -> Result<Self::Iterator> {
        let (merged, sequence, current) = self.inner.new_iterator_components(&options)?;
        Ok(DBIterator::new(merged, self.inner.clone(), sequence, current))
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        let mut versions = self.inner.versions.lock().unwrap();
        let seq = versions.last_sequence();
        versions.snapshots.acquire(seq)
    }

    fn release_snapshot(&self, snapshot: Arc<Snapshot>) {
        let mut versions = self.inner.versions.lock().unwrap();
        versions.snapshots.release(snapshot);
    }

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range_impl(begin, end)
    }

    fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        self.inner.get_approximate_sizes(ranges)
    }

    fn get_property(&self, name: &str) -> Option<String> {
        self.inner.get_property(name)
    }

    fn backup(&self, dir: &str) -> Result<()> {
        self.inner.backup_impl(dir)
    }

    fn get_replay_timestamp(&self) -> String {
        let versions = self.inner.versions.lock().unwrap();
        (versions.last_sequence() + 1).to_string()
    }

    fn get_replay_iterator(&self, timestamp: &str) -> Result<Self::ReplayIterator> {
        let (merged, sequence, current) = self.inner.replay_iterator_components(timestamp)?;
        Ok(ReplayIterator::new(merged, sequence, current))
    }

    fn allow_garbage_collect_before_timestamp(&self, timestamp: &str) -> Result<()> {
        let mut versions = self.inner.versions.lock().unwrap();
        let cutoff = parse_replay_timestamp(timestamp, versions.last_sequence())?;
        versions.manual_gc_cutoff = cutoff;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // wake every worker so it can observe the flag and exit
        let _ = self.inner.do_flush.0.send(());
        let _ = self.inner.do_compaction.0.send(());
        let _ = self.inner.do_optimistic.0.send(());
        self.inner.background_work_finished_signal.notify_all();
        let acks: Vec<_> = self.shutdown_acks.lock().unwrap().drain(..).collect();
        for ack in acks {
            let _ = ack.recv_timeout(Duration::from_secs(10));
        }
        self.inner.close_impl()
    }

    fn destroy(&mut self) -> Result<()> {
        self.close()?;
        self.inner
            .env
            .remove_dir(&self.inner.db_path, true)
    }
}

const FLUSH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// The write-ahead log of one memtable generation. Writers capture it
/// together with the memtable and append to it without holding the
/// version set lock.
struct WalState<F: File> {
    log_number: u64,
    writer: Mutex<Writer<F>>,
}

/// A queued `CompactRange` slice, answered through `done` when the
/// level has been merged down.
struct ManualTask {
    inner: ManualCompaction,
    done: Sender<Result<()>>,
}

pub struct DBImpl<S: Storage + Clone, C: Comparator + 'static> {
    env: S,
    internal_comparator: InternalKeyComparator<C>,
    options: Arc<Options<C>>,
    db_path: String,
    db_lock: Mutex<Option<S::F>>,
    pub(crate) table_cache: TableCache<S>,

    versions: Mutex<VersionSet<S, C>>,
    /// Signalled when a flush or compaction finishes, a level pair
    /// unlocks, or the manifest writer becomes available again.
    background_work_finished_signal: Condvar,

    mem: ShardedLock<Arc<MemTable<C>>>,
    im_mem: ShardedLock<Option<Arc<MemTable<C>>>>,
    wal: ShardedLock<Option<Arc<WalState<S::F>>>>,

    // Ticket-based write admission. `ticket_upper` is the next unused
    // sequence number, `ticket_lower` the first unpublished one.
    // Sequences in between belong to writers currently appending to the
    // log and memtable outside the version set lock.
    ticket_upper: AtomicU64,
    ticket_lower: AtomicU64,
    /// `ticket_upper` at the moment of the last memtable rotation.
    /// Every writer holding the retired memtable carries a smaller
    /// ticket, so the flush waits for `ticket_lower` to pass this.
    imm_boundary: AtomicU64,

    shutting_down: AtomicBool,
    background_activity_allowed: AtomicBool,
    bg_error: RwLock<Option<Error>>,

    do_flush: (Sender<()>, Receiver<()>),
    do_compaction: (Sender<()>, Receiver<()>),
    do_optimistic: (Sender<()>, Receiver<()>),

    manual_compaction_queue: Mutex<VecDeque<ManualTask>>,
    // indexed by output level
    compaction_stats: Mutex<Vec<CompactionStats>>,
}

impl<S: Storage + Clone + 'static, C: Comparator + 'static> DBImpl<S, C> {
    fn new(options: Arc<Options<C>>, db_path: &str, env: S) -> Self {
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let versions = VersionSet::new(db_path.to_owned(), options.clone(), env.clone());
        let table_cache = versions.table_cache.clone();
        let max_levels = options.max_levels;
        Self {
            env,
            internal_comparator: icmp.clone(),
            options,
            db_path: db_path.to_owned(),
            db_lock: Mutex::new(None),
            table_cache,
            versions: Mutex::new(versions),
            background_work_finished_signal: Condvar::new(),
            mem: ShardedLock::new(Arc::new(MemTable::new(icmp))),
            im_mem: ShardedLock::new(None),
            wal: ShardedLock::new(None),
            ticket_upper: AtomicU64::new(1),
            ticket_lower: AtomicU64::new(1),
            imm_boundary: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            background_activity_allowed: AtomicBool::new(false),
            bg_error: RwLock::new(None),
            do_flush: unbounded(),
            do_compaction: unbounded(),
            do_optimistic: unbounded(),
            manual_compaction_queue: Mutex::new(VecDeque::new()),
            compaction_stats: Mutex::new(
                (0..max_levels).map(|_| CompactionStats::default()).collect(),
            ),
        }
    }

    pub(crate) fn trigger_compaction(&self) {
        let _ = self.do_compaction.0.send(());
    }

    fn record_background_error(&self, e: Error) {
        let mut slot = self.bg_error.write().unwrap();
        if slot.is_none() {
            error!("background error: {}", e);
            *slot = Some(e);
        }
    }

    fn check_background_error(&self) -> Result<()> {
        match &*self.bg_error.read().unwrap() {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }

    // ===== open / recovery =====

    /// Writes the manifest of an empty db and points `CURRENT` at it.
    fn initialize_db(&self) -> Result<()> {
        let mut edit = VersionEdit::new(self.options.max_levels);
        edit.set_comparator_name(self.options.comparator.name().to_owned());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);
        let manifest = generate_filename(&self.db_path, FileType::Manifest, 1);
        let file = self.env.create(&manifest)?;
        let mut writer = Writer::new(file);
        let mut record = vec![];
        edit.encode_to(&mut record);
        let result = writer
            .add_record(&record)
            .and_then(|_| writer.sync())
            .and_then(|_| update_current(&self.env, &self.db_path, 1));
        if let Err(e) = result {
            let _ = self.env.remove(&manifest);
            return Err(e);
        }
        Ok(())
    }

    /// Rebuilds the version state from the manifest, replays write-ahead
    /// logs the manifest does not cover, and switches to a fresh log.
    fn recover_db(&self) -> Result<()> {
        let current = generate_filename(&self.db_path, FileType::Current, 0);
        if !self.env.exists(&current) {
            if !self.options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    self.db_path
                )));
            }
            info!("Creating new db at {}", self.db_path);
            self.initialize_db()?;
        } else if self.options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{}: already exists (error_if_exists is true)",
                self.db_path
            )));
        }
        let mut versions = self.versions.lock().unwrap();
        versions.recover()?;

        let min_log = versions.log_number();
        let prev_log = versions.prev_log_number();
        let mut logs = vec![];
        for path in self.env.list(&self.db_path)? {
            if let Some((FileType::Log, number)) = parse_filename(&path) {
                if number >= min_log || number == prev_log {
                    logs.push(number);
                }
            }
        }
        logs.sort_unstable();
        let mut edit = VersionEdit::new(self.options.max_levels);
        let mut max_sequence = 0;
        for number in logs {
            versions.mark_file_number_used(number);
            self.replay_wal(&mut versions, number, &mut edit, &mut max_sequence)?;
        }
        if max_sequence > versions.last_sequence() {
            versions.set_last_sequence(max_sequence);
        }

        // all writes from here on go to a fresh log
        let new_log_number = versions.new_file_number();
        let log_file = self
            .env
            .create(generate_filename(&self.db_path, FileType::Log, new_log_number))?;
        *self.wal.write().unwrap() = Some(Arc::new(WalState {
            log_number: new_log_number,
            writer: Mutex::new(Writer::new(log_file)),
        }));
        edit.set_log_number(new_log_number);
        edit.set_prev_log_number(0);
        let (versions, result) = self.log_and_apply(versions, &mut edit);
        result?;
        let next_ticket = versions.last_sequence() + 1;
        self.ticket_upper.store(next_ticket, Ordering::Release);
        self.ticket_lower.store(next_ticket, Ordering::Release);
        info!(
            "Recovered db at {}: last sequence {}, {}",
            self.db_path,
            versions.last_sequence(),
            versions.level_summary()
        );
        self.delete_obsolete_files(versions);
        Ok(())
    }

    /// Replays one write-ahead log into fresh level-0 tables.
    fn replay_wal(
        &self,
        versions: &mut VersionSet<S, C>,
        log_number: u64,
        edit: &mut VersionEdit,
        max_sequence: &mut u64,
    ) -> Result<()> {
        let path = generate_filename(&self.db_path, FileType::Log, log_number);
        let file = self.env.open(&path)?;
        let reporter = LogReporter::new();
        let mut reader = Reader::new(file, Some(Box::new(reporter.clone())), true, 0);
        info!("Replaying log #{}", log_number);
        let mut mem: Option<MemTable<C>> = None;
        let mut batch = WriteBatch::new();
        while let Some(record) = reader.read_record() {
            if self.options.paranoid_checks {
                reporter.result()?;
            }
            if record.len() < BATCH_HEADER_SIZE {
                warn!(
                    "log #{}: dropping short record of {} bytes",
                    log_number,
                    record.len()
                );
                continue;
            }
            batch.set_contents(record)?;
            let table = mem.get_or_insert_with(|| MemTable::new(self.internal_comparator.clone()));
            batch.insert_into(table)?;
            let last = batch.get_sequence() + u64::from(batch.get_count()) - 1;
            if last > *max_sequence {
                *max_sequence = last;
            }
            if table.approximate_memory_usage() > self.options.write_buffer_size {
                if let Some(full) = mem.take() {
                    self.flush_recovered_memtable(versions, &full, edit)?;
                }
            }
        }
        if self.options.paranoid_checks {
            reporter.result()?;
        } else if let Err(e) = reporter.result() {
            warn!("log #{}: ignoring tail corruption: {}", log_number, e);
        }
        if let Some(full) = mem {
            if !full.is_empty() {
                self.flush_recovered_memtable(versions, &full, edit)?;
            }
        }
        Ok(())
    }

    fn flush_recovered_memtable(
        &self,
        versions: &mut VersionSet<S, C>,
        mem: &MemTable<C>,
        edit: &mut VersionEdit,
    ) -> Result<()> {
        let number = versions.new_file_number();
        versions.pending_outputs.insert(number);
        let result = build_table(
            &self.env,
            &self.db_path,
            self.internal_comparator.clone(),
            &self.table_cache,
            mem.iter(),
            number,
        );
        versions.pending_outputs.remove(&number);
        match result {
            Ok(Some(meta)) => {
                // recovered tables always land in level 0
                info!(
                    "Recovered level-0 table #{}: {} bytes",
                    meta.number, meta.file_size
                );
                edit.add_file(
                    0,
                    meta.number,
                    meta.file_size,
                    meta.smallest.clone(),
                    meta.largest.clone(),
                );
                Ok(())
            }
            Ok(None) => {
                versions.reuse_file_number(number);
                Ok(())
            }
            Err(e) => {
                versions.reuse_file_number(number);
                Err(e)
            }
        }
    }

    // ===== the write path =====

    fn write_impl(&self, options: WriteOptions, mut batch: WriteBatch) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::DBClosed("write".to_owned()));
        }
        if batch.is_empty() {
            // an empty batch means "flush the memtable and wait"
            return self.force_compact_mem_table();
        }
        let versions = self.versions.lock().unwrap();
        let versions = self.make_room_for_write(versions, false)?;

        // Capture the log and memtable handles and reserve our sequence
        // range while still under the lock, so every writer using the
        // old memtable carries a smaller ticket than any writer using
        // the new one. The expensive appends happen after unlock.
        let wal = match self.wal.read().unwrap().as_ref() {
            Some(w) => w.clone(),
            None => return Err(Error::DBClosed("write".to_owned())),
        };
        let mem = self.mem.read().unwrap().clone();
        let n = u64::from(batch.get_count());
        let start = self.ticket_upper.fetch_add(n, Ordering::SeqCst);
        drop(versions);

        batch.set_sequence(start);
        let log_result = {
            let mut writer = wal.writer.lock().unwrap();
            writer.add_record(batch.data()).and_then(|_| {
                if options.sync {
                    writer.sync()
                } else {
                    Ok(())
                }
            })
        };
        let mem_result = batch.insert_into(&mem);
        let result = log_result.and(mem_result);

        // publish in ticket order
        while self.ticket_lower.load(Ordering::Acquire) != start {
            std::hint::spin_loop();
        }
        {
            let mut versions = self.versions.lock().unwrap();
            versions.set_last_sequence(start + n - 1);
        }
        self.ticket_lower.fetch_add(n, Ordering::AcqRel);

        if let Err(e) = &result {
            if options.sync {
                // a failed sync leaves the log tail undefined
                self.record_background_error(e.duplicate());
            }
        }
        result
    }

    /// Ensures the active memtable can take another write, slowing or
    /// stalling the caller while level 0 is congested, and rotating to
    /// a fresh memtable and log when the current one is full.
    fn make_room_for_write<'a>(
        &'a self,
        mut versions: MutexGuard<'a, VersionSet<S, C>>,
        mut force: bool,
    ) -> Result<MutexGuard<'a, VersionSet<S, C>>> {
        let mut allow_delay = !force;
        loop {
            self.check_background_error()?;
            if allow_delay
                && versions.num_level_files(0) >= self.options.l0_slowdown_writes_threshold
            {
                // give the compaction a little room instead of stalling
                // a single write for seconds once the hard limit hits;
                // level 0 nearing its stall trigger is also the cue for
                // the optimistic pass to clear cheap work downstream
                drop(versions);
                let _ = self.do_optimistic.0.send(());
                thread::sleep(Duration::from_millis(1));
                allow_delay = false;
                versions = self.versions.lock().unwrap();
                continue;
            }
            let mem_usage = self.mem.read().unwrap().approximate_memory_usage();
            if !force && mem_usage <= self.options.write_buffer_size {
                return Ok(versions);
            }
            if self.im_mem.read().unwrap().is_some() {
                // the previous memtable is still being flushed
                versions = self
                    .background_work_finished_signal
                    .wait(versions)
                    .unwrap();
                continue;
            }
            if versions.num_level_files(0) >= self.options.l0_stop_writes_threshold {
                info!("Too many L0 files; waiting...");
                versions = self
                    .background_work_finished_signal
                    .wait(versions)
                    .unwrap();
                continue;
            }

            // rotate to a fresh log and memtable
            let new_log_number = versions.new_file_number();
            let log_file = match self
                .env
                .create(generate_filename(&self.db_path, FileType::Log, new_log_number))
            {
                Ok(f) => f,
                Err(e) => {
                    versions.reuse_file_number(new_log_number);
                    return Err(e);
                }
            };
            *self.wal.write().unwrap() = Some(Arc::new(WalState {
                log_number: new_log_number,
                writer: Mutex::new(Writer::new(log_file)),
            }));
            {
                let mut mem = self.mem.write().unwrap();
                let mut im_mem = self.im_mem.write().unwrap();
                *im_mem = Some(mem.clone());
                *mem = Arc::new(MemTable::new(self.internal_comparator.clone()));
            }
            self.imm_boundary
                .store(self.ticket_upper.load(Ordering::Acquire), Ordering::Release);
            let _ = self.do_flush.0.send(());
            force = false;
        }
    }

    /// Rotates the current memtable out (even when small) and blocks
    /// until it has been flushed into a table file.
    fn force_compact_mem_table(&self) -> Result<()> {
        {
            let versions = self.versions.lock().unwrap();
            if self.mem.read().unwrap().is_empty() && self.im_mem.read().unwrap().is_none() {
                return Ok(());
            }
            if !self.mem.read().unwrap().is_empty() {
                let versions = self.make_room_for_write(versions, true)?;
                drop(versions);
            }
        }
        let mut versions = self.versions.lock().unwrap();
        while self.im_mem.read().unwrap().is_some() {
            self.check_background_error()?;
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::DBClosed("memtable flush".to_owned()));
            }
            versions = self
                .background_work_finished_signal
                .wait(versions)
                .unwrap();
        }
        Ok(())
    }

    // ===== reads =====

    fn get_impl(&self, opts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::DBClosed("get".to_owned()));
        }
        let (sequence, mem, im_mem, current) = {
            let versions = self.versions.lock().unwrap();
            let sequence = match &opts.snapshot {
                Some(s) => s.sequence(),
                None => versions.last_sequence(),
            };
            (
                sequence,
                self.mem.read().unwrap().clone(),
                self.im_mem.read().unwrap().clone(),
                versions.current(),
            )
        };
        let lookup = LookupKey::new(key, sequence);
        match mem.get(&lookup) {
            Some(Ok(value)) => return Ok(Some(value)),
            Some(Err(Error::NotFound(_))) => return Ok(None),
            Some(Err(e)) => return Err(e),
            None => {}
        }
        if let Some(im) = im_mem {
            match im.get(&lookup) {
                Some(Ok(value)) => return Ok(Some(value)),
                Some(Err(Error::NotFound(_))) => return Ok(None),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }
        let (value, seek_stats) = current.get(opts, &lookup, &self.table_cache)?;
        if current.update_stats(seek_stats) {
            self.trigger_compaction();
        }
        Ok(value)
    }

    /// The merged internal iterator, pinned sequence and pinned version
    /// a `DBIterator` is built from.
    fn new_iterator_components(
        &self,
        opts: &ReadOptions,
    ) -> Result<(
        MergingIterator<InternalKeyComparator<C>>,
        u64,
        Arc<crate::version::Version<C>>,
    )> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::DBClosed("iterator".to_owned()));
        }
        let versions = self.versions.lock().unwrap();
        let sequence = match &opts.snapshot {
            Some(s) => s.sequence(),
            None => versions.last_sequence(),
        };
        let mut children: Vec<Box<dyn Iterator>> = vec![];
        children.push(Box::new(self.mem.read().unwrap().iter()));
        if let Some(im) = self.im_mem.read().unwrap().as_ref() {
            children.push(Box::new(im.iter()));
        }
        let current = versions.current();
        current.append_iterators(opts, &self.table_cache, &mut children)?;
        let merged = MergingIterator::new(self.internal_comparator.clone(), children);
        Ok((merged, sequence, current))
    }

    fn replay_iterator_components(
        &self,
        timestamp: &str,
    ) -> Result<(
        MergingIterator<InternalKeyComparator<C>>,
        u64,
        Arc<crate::version::Version<C>>,
    )> {
        let sequence = {
            let versions = self.versions.lock().unwrap();
            parse_replay_timestamp(timestamp, versions.last_sequence())?
        };
        let (merged, _, current) = self.new_iterator_components(&ReadOptions::default())?;
        Ok((merged, sequence, current))
    }

    fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let current = self.versions.lock().unwrap().current();
        ranges
            .iter()
            .map(|(start, limit)| {
                let k1 = InternalKey::new(start, MAX_KEY_SEQUENCE, VALUE_TYPE_FOR_SEEK);
                let k2 = InternalKey::new(limit, MAX_KEY_SEQUENCE, VALUE_TYPE_FOR_SEEK);
                let o1 = current.approximate_offset_of(&k1, &self.table_cache);
                let o2 = current.approximate_offset_of(&k2, &self.table_cache);
                o2.saturating_sub(o1)
            })
            .collect()
    }

    fn get_property(&self, name: &str) -> Option<String> {
        let value = name.strip_prefix("silt.")?;
        if let Some(rest) = value.strip_prefix("num-files-at-level") {
            let level = rest.parse::<usize>().ok()?;
            if level >= self.options.max_levels {
                return None;
            }
            let versions = self.versions.lock().unwrap();
            return Some(versions.num_level_files(level).to_string());
        }
        match value {
            "stats" => {
                let versions = self.versions.lock().unwrap();
                let stats = self.compaction_stats.lock().unwrap();
                let mut s = String::from(
                    "                               Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                for level in 0..self.options.max_levels {
                    let files = versions.num_level_files(level);
                    let st = &stats[level];
                    if files > 0 || st.micros > 0 {
                        s.push_str(&format!(
                            "{:3} {:8} {:8.0} {:9.3} {:8.0} {:9.0}\n",
                            level,
                            files,
                            versions.num_level_bytes(level) as f64 / 1_048_576.0,
                            st.micros as f64 / 1e6,
                            st.bytes_read as f64 / 1_048_576.0,
                            st.bytes_written as f64 / 1_048_576.0,
                        ));
                    }
                }
                Some(s)
            }
            "sstables" => Some(self.versions.lock().unwrap().sstable_summary()),
            "approximate-memory-usage" => {
                let mem = self.mem.read().unwrap().approximate_memory_usage();
                let im = self
                    .im_mem
                    .read()
                    .unwrap()
                    .as_ref()
                    .map_or(0, |m| m.approximate_memory_usage());
                Some((mem + im).to_string())
            }
            _ => None,
        }
    }

    // ===== manifest commits =====

    /// Commits `edit` to the manifest and installs the resulting
    /// version. The version set lock is released for the duration of
    /// the manifest append and fsync; `manifest_write_busy` keeps
    /// concurrent commits queued on the condvar meanwhile.
    ///
    /// When the write fails, the manifest is re-read: if the record
    /// made it to disk anyway the commit counts as durable and is
    /// installed; otherwise the manifest writer is abandoned so the
    /// next commit starts a fresh manifest file.
    fn log_and_apply<'a>(
        &'a self,
        mut versions: MutexGuard<'a, VersionSet<S, C>>,
        edit: &mut VersionEdit,
    ) -> (MutexGuard<'a, VersionSet<S, C>>, Result<()>) {
        while versions.manifest_write_busy {
            versions = self
                .background_work_finished_signal
                .wait(versions)
                .unwrap();
        }
        versions.prepare_edit(edit);
        let version = versions.build_new_version(edit);
        let first_manifest = versions.manifest_writer.is_none();
        if first_manifest {
            if let Err(e) = versions.create_manifest() {
                return (versions, Err(e));
            }
        }
        let mut writer = versions.manifest_writer.take().unwrap();
        let manifest_number = versions.manifest_number();
        let mut record = vec![];
        edit.encode_to(&mut record);
        versions.manifest_write_busy = true;
        drop(versions);

        let mut write_result = writer.add_record(&record).and_then(|_| writer.sync());
        if write_result.is_ok() && first_manifest {
            write_result = update_current(&self.env, &self.db_path, manifest_number);
        }

        let mut versions = self.versions.lock().unwrap();
        versions.manifest_write_busy = false;
        let result = match write_result {
            Ok(()) => {
                versions.manifest_writer = Some(writer);
                versions.install_new_version(version, edit);
                Ok(())
            }
            Err(e) => {
                // the record may have hit the disk before the error
                let durable = versions.manifest_contains(&record)
                    && (!first_manifest
                        || update_current(&self.env, &self.db_path, manifest_number).is_ok());
                if durable {
                    info!("MANIFEST write reported failure but record is durable");
                    versions.manifest_writer = Some(writer);
                    versions.install_new_version(version, edit);
                    Ok(())
                } else {
                    warn!("MANIFEST write failed: {}", e);
                    versions.abandon_manifest();
                    if first_manifest {
                        let name =
                            generate_filename(&self.db_path, FileType::Manifest, manifest_number);
                        let _ = self.env.remove(&name);
                    }
                    Err(e)
                }
            }
        };
        self.background_work_finished_signal.notify_all();
        (versions, result)
    }

    // ===== flushing =====

    /// Flushes the immutable memtable into a table file and commits it.
    fn compact_mem_table(&self) -> Result<()> {
        // writers that captured the retired memtable may still be
        // inserting; wait until all their tickets have been published
        let boundary = self.imm_boundary.load(Ordering::Acquire);
        while self.ticket_lower.load(Ordering::Acquire) < boundary {
            thread::yield_now();
        }
        let im_mem = match self.im_mem.read().unwrap().clone() {
            Some(m) => m,
            None => return Ok(()),
        };
        let versions = self.versions.lock().unwrap();
        let log_number = self
            .wal
            .read()
            .unwrap()
            .as_ref()
            .map_or(versions.log_number(), |w| w.log_number);
        let (versions, result) = self.write_level0_table(versions, &im_mem, log_number);
        match result {
            Ok(()) => {
                *self.im_mem.write().unwrap() = None;
                self.delete_obsolete_files(versions);
                self.background_work_finished_signal.notify_all();
                Ok(())
            }
            Err(e) => {
                drop(versions);
                self.background_work_finished_signal.notify_all();
                Err(e)
            }
        }
    }

    fn write_level0_table<'a>(
        &'a self,
        mut versions: MutexGuard<'a, VersionSet<S, C>>,
        mem: &MemTable<C>,
        log_number: u64,
    ) -> (MutexGuard<'a, VersionSet<S, C>>, Result<()>) {
        let number = versions.new_file_number();
        versions.pending_outputs.insert(number);
        info!("Level-0 table #{}: started", number);
        drop(versions);

        let build_result = build_table(
            &self.env,
            &self.db_path,
            self.internal_comparator.clone(),
            &self.table_cache,
            mem.iter(),
            number,
        );

        let mut versions = self.versions.lock().unwrap();
        versions.pending_outputs.remove(&number);
        let mut edit = VersionEdit::new(self.options.max_levels);
        match build_result {
            Err(e) => {
                versions.reuse_file_number(number);
                return (versions, Err(e));
            }
            Ok(None) => {
                versions.reuse_file_number(number);
            }
            Ok(Some(meta)) => {
                info!("Level-0 table #{}: {} bytes", number, meta.file_size);
                // always level 0: installs there only append, so the
                // flush can never race a compaction installing into a
                // deeper level while log_and_apply has the lock dropped
                edit.add_file(
                    0,
                    meta.number,
                    meta.file_size,
                    meta.smallest.clone(),
                    meta.largest.clone(),
                );
            }
        }
        // everything below this log number is now in table files
        edit.set_log_number(log_number);
        self.log_and_apply(versions, &mut edit)
    }

    // ===== compaction =====

    /// One pass of the level-compaction worker: a queued manual request
    /// first, otherwise whatever the version set picks.
    fn background_compaction(&self) -> Result<()> {
        let mut versions = self.versions.lock().unwrap();
        let manual = self.manual_compaction_queue.lock().unwrap().pop_front();
        if let Some(mut task) = manual {
            let level = task.inner.level;
            loop {
                if self.shutting_down.load(Ordering::Acquire) {
                    let _ = task
                        .done
                        .send(Err(Error::DBClosed("manual compaction".to_owned())));
                    return Ok(());
                }
                if versions.try_lock_level_pair(level) {
                    break;
                }
                versions = self
                    .background_work_finished_signal
                    .wait(versions)
                    .unwrap();
            }
            // a manual pass over a deep level is bounded to roughly one
            // output file of input; keep resuming past the last
            // compacted key until the whole range is covered
            let result = loop {
                match versions.compact_range(&mut task.inner) {
                    Some(compaction) => {
                        let resume = compaction.inputs[0].last().map(|f| f.largest.clone());
                        let (v, r) = self.run_compaction(versions, compaction);
                        versions = v;
                        if r.is_err()
                            || task.inner.done
                            || self.shutting_down.load(Ordering::Acquire)
                        {
                            break r;
                        }
                        task.inner.begin = resume;
                    }
                    None => break Ok(()),
                }
            };
            versions.unlock_level_pair(level);
            let outcome = result.as_ref().map(|_| ()).map_err(|e| e.duplicate());
            let _ = task.done.send(result);
            self.delete_obsolete_files(versions);
            self.background_work_finished_signal.notify_all();
            return outcome;
        }

        if let Some(compaction) = versions.pick_compaction() {
            let level = compaction.level;
            if versions.try_lock_level_pair(level) {
                let (v, result) = self.run_compaction(versions, compaction);
                versions = v;
                versions.unlock_level_pair(level);
                self.delete_obsolete_files(versions);
                self.background_work_finished_signal.notify_all();
                return result;
            }
        }
        Ok(())
    }

    /// Repeatedly sweeps the middle levels for merges whose ratio of
    /// moved to rewritten bytes beats the configured threshold, taking
    /// trivial moves whenever one exists. Returns once no level offers
    /// worthwhile work.
    fn optimistic_compaction(&self) -> Result<()> {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Ok(());
            }
            let mut versions = self.versions.lock().unwrap();
            let mut best: Option<Compaction<S::F, C>> = None;
            for level in 1..self.options.max_levels - 2 {
                if !versions.is_level_pair_unlocked(level) {
                    continue;
                }
                if let Some(candidate) =
                    versions.pick_compaction_at_level(level, crate::compaction::CompactionReason::Ratio)
                {
                    if candidate.is_trivial_move() {
                        best = Some(candidate);
                        break;
                    }
                    let better = match &best {
                        Some(b) => candidate.work_ratio() > b.work_ratio(),
                        None => true,
                    };
                    if better {
                        best = Some(candidate);
                    }
                }
            }
            let compaction = match best {
                Some(c)
                    if c.is_trivial_move()
                        || c.work_ratio() > self.options.optimistic_ratio_threshold =>
                {
                    c
                }
                _ => return Ok(()),
            };
            let level = compaction.level;
            if !versions.try_lock_level_pair(level) {
                continue;
            }
            let (v, result) = self.run_compaction(versions, compaction);
            let mut versions = v;
            versions.unlock_level_pair(level);
            self.delete_obsolete_files(versions);
            self.background_work_finished_signal.notify_all();
            result?;
        }
    }

    /// Executes a planned compaction: a pure file move when possible,
    /// a full merge otherwise.
    fn run_compaction<'a>(
        &'a self,
        versions: MutexGuard<'a, VersionSet<S, C>>,
        mut c: Compaction<S::F, C>,
    ) -> (MutexGuard<'a, VersionSet<S, C>>, Result<()>) {
        if c.is_trivial_move() {
            let f = c.inputs[0][0].clone();
            c.edit.delete_file(c.level, f.number);
            c.edit
                .add_file(c.level + 1, f.number, f.file_size, f.smallest.clone(), f.largest.clone());
            let (versions, result) = self.log_and_apply(versions, &mut c.edit);
            if result.is_ok() {
                info!(
                    "Moved #{} to level-{}, {} bytes ({:?}): {}",
                    f.number,
                    c.level + 1,
                    f.file_size,
                    c.reason,
                    versions.level_summary()
                );
            }
            (versions, result)
        } else {
            self.do_compaction_work(versions, c)
        }
    }

    /// Merges the input files of `c` into fresh files at the output
    /// level, dropping entries no snapshot or replay consumer can still
    /// observe, and commits the swap.
    fn do_compaction_work<'a>(
        &'a self,
        versions: MutexGuard<'a, VersionSet<S, C>>,
        mut c: Compaction<S::F, C>,
    ) -> (MutexGuard<'a, VersionSet<S, C>>, Result<()>) {
        let start = Instant::now();
        let level = c.level;
        info!(
            "Compacting {}@{} + {}@{} files ({:?})",
            c.inputs[0].len(),
            level,
            c.inputs[1].len(),
            level + 1,
            c.reason
        );
        let smallest_snapshot = versions.smallest_snapshot();
        drop(versions);

        let merge_result = self.merge_compaction_inputs(&mut c, smallest_snapshot);
        let bytes_read = c.total_input_bytes();
        let bytes_written = c.total_bytes;
        let output_numbers: Vec<u64> = c.outputs.iter().map(|f| f.number).collect();

        let versions = self.versions.lock().unwrap();
        let (mut versions, result) = match merge_result {
            Ok(()) => {
                c.apply_to_edit();
                let (mut versions, result) = self.log_and_apply(versions, &mut c.edit);
                for number in &output_numbers {
                    versions.pending_outputs.remove(number);
                }
                if result.is_err() {
                    self.discard_compaction_outputs(&output_numbers);
                }
                (versions, result)
            }
            Err(e) => {
                let mut versions = versions;
                for number in &output_numbers {
                    versions.pending_outputs.remove(number);
                }
                self.discard_compaction_outputs(&output_numbers);
                (versions, Err(e))
            }
        };
        self.compaction_stats.lock().unwrap()[level + 1].accumulate(
            start.elapsed().as_micros() as u64,
            bytes_read,
            bytes_written,
        );
        if result.is_ok() {
            info!("Compacted to: {}", versions.level_summary());
        }
        (versions, result)
    }

    fn discard_compaction_outputs(&self, numbers: &[u64]) {
        for number in numbers {
            self.table_cache.evict(*number);
            let _ = self
                .env
                .remove(generate_filename(&self.db_path, FileType::Table, *number));
        }
    }

    fn merge_compaction_inputs(
        &self,
        c: &mut Compaction<S::F, C>,
        smallest_snapshot: u64,
    ) -> Result<()> {
        use crate::db::format::{ParsedInternalKey, ValueType};

        let icmp = self.internal_comparator.clone();
        let ucmp = icmp.user_comparator.clone();
        let mut iter = self.new_compaction_input_iterator(c)?;
        iter.seek_to_first();
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = u64::MAX;
        while iter.valid() {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::DBClosed("compaction".to_owned()));
            }
            let ikey = iter.key().to_vec();
            if c.builder.is_some() && c.should_stop_before(&ikey, &icmp) {
                self.finish_compaction_output(c)?;
            }
            let mut drop_entry = false;
            match ParsedInternalKey::decode_from(&ikey) {
                None => {
                    // keep unparsable keys; hiding them could mask
                    // real corruption from the user
                    current_user_key = None;
                    last_sequence_for_key = u64::MAX;
                }
                Some(parsed) => {
                    let first_occurrence = match &current_user_key {
                        Some(key) => ucmp.compare(key, parsed.user_key) != CmpOrdering::Equal,
                        None => true,
                    };
                    if first_occurrence {
                        current_user_key = Some(parsed.user_key.to_vec());
                        last_sequence_for_key = u64::MAX;
                    }
                    if last_sequence_for_key <= smallest_snapshot {
                        // shadowed by a newer entry every observer
                        // already sees
                        drop_entry = true;
                    } else if parsed.value_type == ValueType::Deletion
                        && parsed.seq <= smallest_snapshot
                        && !c.key_exist_in_deeper_levels(parsed.user_key)
                    {
                        // the tombstone deleted nothing below us, and
                        // nothing older of this key survives above
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.seq;
                }
            }

            if !drop_entry {
                if c.builder.is_none() {
                    self.open_compaction_output(c)?;
                }
                let mut cut_output = false;
                if let (Some(builder), Some(output)) = (c.builder.as_mut(), c.outputs.last_mut()) {
                    if builder.num_entries() == 0 {
                        output.smallest = InternalKey::decoded_from(&ikey);
                    }
                    output.largest = InternalKey::decoded_from(&ikey);
                    builder.add(&ikey, iter.value())?;
                    cut_output = builder.file_size() >= self.options.max_file_size as u64;
                }
                if cut_output {
                    self.finish_compaction_output(c)?;
                }
            }
            iter.next();
        }
        iter.status()?;
        if c.builder.is_some() {
            self.finish_compaction_output(c)?;
        }
        Ok(())
    }

    fn new_compaction_input_iterator(
        &self,
        c: &Compaction<S::F, C>,
    ) -> Result<MergingIterator<InternalKeyComparator<C>>> {
        let read_opts = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };
        let mut children: Vec<Box<dyn Iterator>> = vec![];
        for (delta, files) in c.inputs.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            if c.level + delta == 0 {
                // level-0 files overlap, so each one merges separately
                for f in files.iter() {
                    children.push(Box::new(self.table_cache.new_iter(
                        self.internal_comparator.clone(),
                        &read_opts,
                        f.number,
                        f.file_size,
                    )?));
                }
            } else {
                let index_iter =
                    LevelFileNumIterator::new(self.internal_comparator.clone(), files.clone());
                let factory = FileIterFactory::new(
                    self.internal_comparator.clone(),
                    read_opts.clone(),
                    self.table_cache.clone(),
                );
                children.push(Box::new(ConcatenateIterator::new(index_iter, factory)));
            }
        }
        Ok(MergingIterator::new(self.internal_comparator.clone(), children))
    }

    fn open_compaction_output(&self, c: &mut Compaction<S::F, C>) -> Result<()> {
        let number = {
            let mut versions = self.versions.lock().unwrap();
            let number = versions.new_file_number();
            versions.pending_outputs.insert(number);
            number
        };
        let file = self
            .env
            .create(generate_filename(&self.db_path, FileType::Table, number))?;
        c.builder = Some(TableBuilder::new(file, self.internal_comparator.clone()));
        let mut meta = FileMetaData::default();
        meta.number = number;
        c.outputs.push(meta);
        Ok(())
    }

    fn finish_compaction_output(&self, c: &mut Compaction<S::F, C>) -> Result<()> {
        if let (Some(mut builder), Some(output)) = (c.builder.take(), c.outputs.last_mut()) {
            let entries = builder.num_entries();
            builder.finish(true)?;
            output.file_size = builder.file_size();
            output.init_allowed_seeks();
            c.total_bytes += output.file_size;
            if entries > 0 {
                // read it back so a bad write surfaces now, not at
                // some random future get
                self.table_cache
                    .find_table(&ReadOptions::default(), output.number, output.file_size)?;
                info!(
                    "Generated table #{}: {} keys, {} bytes",
                    output.number, entries, output.file_size
                );
            }
        }
        Ok(())
    }

    /// Flushes the memtable, then walks the affected levels from the
    /// top down, queueing one manual compaction per level and waiting
    /// for each to finish.
    fn compact_range_impl(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.force_compact_mem_table()?;
        let max_level_with_files = {
            let versions = self.versions.lock().unwrap();
            let current = versions.current();
            let mut max = 1;
            for level in 1..self.options.max_levels {
                if current.overlap_in_level(level, begin, end) {
                    max = level;
                }
            }
            max
        };
        for level in 0..max_level_with_files {
            if level + 1 >= self.options.max_levels {
                break;
            }
            self.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        let task = ManualTask {
            inner: ManualCompaction {
                level,
                done: false,
                begin: begin.map(|key| InternalKey::new(key, MAX_KEY_SEQUENCE, VALUE_TYPE_FOR_SEEK)),
                end: end.map(|key| InternalKey::new(key, 0, crate::db::format::ValueType::Deletion)),
            },
            done: done_tx,
        };
        self.manual_compaction_queue.lock().unwrap().push_back(task);
        self.trigger_compaction();
        match done_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::DBClosed("manual compaction".to_owned())),
        }
    }

    // ===== file retirement =====

    /// Deletes every file in the db directory no live version, pending
    /// output, log or manifest still needs.
    fn delete_obsolete_files(&self, mut versions: MutexGuard<VersionSet<S, C>>) {
        if self.bg_error.read().unwrap().is_some() {
            // with a latched error the version state may not reflect
            // what is durable; keep everything
            return;
        }
        let live = versions.live_files();
        let log_number = versions.log_number();
        let prev_log_number = versions.prev_log_number();
        let manifest_number = versions.manifest_number();
        drop(versions);
        let files = match self.env.list(&self.db_path) {
            Ok(files) => files,
            Err(e) => {
                warn!("listing db dir for cleanup failed: {}", e);
                return;
            }
        };
        for path in files {
            if let Some((file_type, number)) = parse_filename(&path) {
                let keep = match file_type {
                    FileType::Log => number >= log_number || number == prev_log_number,
                    FileType::Manifest => number >= manifest_number,
                    FileType::Table => live.contains(&number),
                    FileType::Temp => live.contains(&number),
                    FileType::Current
                    | FileType::Lock
                    | FileType::InfoLog
                    | FileType::OldInfoLog => true,
                };
                if !keep {
                    if file_type == FileType::Table {
                        self.table_cache.evict(number);
                    }
                    info!("Delete {:?} #{}", file_type, number);
                    if let Err(e) = self.env.remove(&path) {
                        warn!("deleting {:?} #{} failed: {}", file_type, number, e);
                    }
                }
            }
        }
    }

    // ===== backup =====

    /// Copies a consistent snapshot of the db into `backup_dir`: the
    /// memtable is flushed first, then manifest mutation is quiesced
    /// while table files are hard-linked and the metadata files and
    /// logs are copied.
    fn backup_impl(&self, backup_dir: &str) -> Result<()> {
        self.force_compact_mem_table()?;
        let mut versions = self.versions.lock().unwrap();
        while versions.manifest_write_busy {
            versions = self
                .background_work_finished_signal
                .wait(versions)
                .unwrap();
        }
        self.env.mkdir_all(backup_dir)?;
        let current = versions.current();
        for files in current.files.iter() {
            for f in files.iter() {
                let src = generate_filename(&self.db_path, FileType::Table, f.number);
                let dst = generate_filename(backup_dir, FileType::Table, f.number);
                self.env.link(&src, &dst)?;
            }
        }
        // manifest and logs keep growing, so they are copied rather
        // than linked
        self.copy_file(
            &generate_filename(&self.db_path, FileType::Manifest, versions.manifest_number()),
            &generate_filename(backup_dir, FileType::Manifest, versions.manifest_number()),
        )?;
        self.copy_file(
            &generate_filename(&self.db_path, FileType::Current, 0),
            &generate_filename(backup_dir, FileType::Current, 0),
        )?;
        for path in self.env.list(&self.db_path)? {
            if let Some((FileType::Log, number)) = parse_filename(&path) {
                self.copy_file(&path, &generate_filename(backup_dir, FileType::Log, number))?;
            }
        }
        info!("Backed up db to {}", backup_dir);
        Ok(())
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut contents = vec![];
        self.env.open(src)?.read_all(&mut contents)?;
        let mut file = self.env.create(dst)?;
        file.write(&contents)?;
        file.sync()?;
        file.close()
    }

    // ===== shutdown =====

    fn close_impl(&self) -> Result<()> {
        if let Some(wal) = self.wal.write().unwrap().take() {
            let mut writer = wal.writer.lock().unwrap();
            let _ = writer.flush();
            let _ = writer.sync();
        }
        if let Some(lock_file) = self.db_lock.lock().unwrap().take() {
            lock_file.unlock()?;
        }
        info!("DB {} closed", self.db_path);
        Ok(())
    }
}

impl<S: Storage + Clone, C: Comparator + 'static> Drop for DBImpl<S, C> {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        if let Some(lock_file) = self.db_lock.lock().unwrap().take() {
            let _ = lock_file.unlock();
        }
    }
}

/// Turns a replay timestamp into a sequence number. `"all"` names the
/// beginning of history and `"now"` the next write.
fn parse_replay_timestamp(timestamp: &str, last_sequence: u64) -> Result<u64> {
    match timestamp {
        "all" => Ok(0),
        "now" => Ok(last_sequence + 1),
        _ => timestamp
            .parse::<u64>()
            .map_err(|_| Error::InvalidArgument(format!("bad replay timestamp: {}", timestamp))),
    }
}

/// Drains `iter` into table file `number`, returning its metadata, or
/// `None` when the iterator was empty. The written table is opened
/// back through the cache to verify it is readable.
pub(crate) fn build_table<S: Storage + Clone, C: Comparator + 'static, I: Iterator>(
    env: &S,
    db_path: &str,
    icmp: InternalKeyComparator<C>,
    table_cache: &TableCache<S>,
    mut iter: I,
    number: u64,
) -> Result<Option<FileMetaData>> {
    iter.seek_to_first();
    if !iter.valid() {
        iter.status()?;
        return Ok(None);
    }
    let name = generate_filename(db_path, FileType::Table, number);
    let mut meta = FileMetaData::default();
    meta.number = number;
    meta.smallest = InternalKey::decoded_from(iter.key());
    let file = env.create(&name)?;
    let mut builder = TableBuilder::new(file, icmp);
    let result = (|| -> Result<()> {
        while iter.valid() {
            meta.largest = InternalKey::decoded_from(iter.key());
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        iter.status()?;
        builder.finish(true)?;
        meta.file_size = builder.file_size();
        meta.init_allowed_seeks();
        table_cache.find_table(&ReadOptions::default(), number, meta.file_size)?;
        Ok(())
    })();
    match result {
        Ok(()) => Ok(Some(meta)),
        Err(e) => {
            let _ = env.remove(&name);
            Err(e)
        }
    }
}
