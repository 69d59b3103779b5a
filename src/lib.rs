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

//! silt is an embedded, persistent key-value store built on a
//! log-structured merge tree, with concurrency-oriented compaction:
//! writes are admitted by lock-free sequence tickets, level pairs are
//! compacted in parallel under independent locks, and an optimistic
//! background pass moves cheap-to-merge data down the tree ahead of
//! time.
//!
//! ```no_run
//! use silt::{SiltDB, DB, Options, BytewiseComparator, ReadOptions, WriteOptions};
//! use silt::storage::file::FileStorage;
//!
//! let options = Options::<BytewiseComparator>::default();
//! let db = SiltDB::open_db(options, "/tmp/silt-demo", FileStorage::default()).unwrap();
//! db.put(WriteOptions::default(), b"key", b"value").unwrap();
//! assert_eq!(
//!     db.get(ReadOptions::default(), b"key").unwrap(),
//!     Some(b"value".to_vec()),
//! );
//! ```

pub mod batch;
mod cache;
pub mod compaction;
pub mod db;
mod error;
pub mod iterator;
mod logger;
pub mod mem;
pub mod options;
mod record;
pub mod snapshot;
pub mod sstable;
pub mod storage;
pub mod table_cache;
pub mod util;
pub mod version;

pub use batch::WriteBatch;
pub use db::iterator::{SiltDBIterator, SiltReplayIterator};
pub use db::{SiltDB, DB};
pub use error::{Error, Result};
pub use iterator::Iterator;
pub use options::{Options, ReadOptions, WriteOptions};
pub use snapshot::Snapshot;
pub use storage::{File, Storage};
pub use util::comparator::{BytewiseComparator, Comparator};
