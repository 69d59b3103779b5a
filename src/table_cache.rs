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

use crate::cache::{Cache, LRUCache};
use crate::db::filename::{generate_filename, FileType};
use crate::options::ReadOptions;
use crate::sstable::table::{Table, TableIterator};
use crate::storage::Storage;
use crate::util::comparator::Comparator;
use crate::Result;
use std::sync::Arc;

/// Shared cache of open table files, keyed by file number.
pub struct TableCache<S: Storage + Clone> {
    env: S,
    db_path: String,
    cache: Arc<LRUCache<u64, Arc<Table>>>,
}

impl<S: Storage + Clone> Clone for TableCache<S> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            db_path: self.db_path.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<S: Storage + Clone> TableCache<S> {
    pub fn new(db_path: String, capacity: usize, env: S) -> Self {
        Self {
            env,
            db_path,
            cache: Arc::new(LRUCache::new(capacity)),
        }
    }

    /// Returns the open table for `file_number`, opening and caching it
    /// on a miss.
    pub fn find_table(
        &self,
        opts: &ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Result<Arc<Table>> {
        if let Some(t) = self.cache.get(&file_number) {
            return Ok(t);
        }
        let filename = generate_filename(&self.db_path, FileType::Table, file_number);
        let file = self.env.open(&filename)?;
        let table = Arc::new(Table::open(&file, file_size, opts.verify_checksums)?);
        if opts.fill_cache {
            self.cache.insert(file_number, table.clone());
        }
        Ok(table)
    }

    /// Finds the first entry at or past `ikey` in the given file.
    pub fn get<C: Comparator>(
        &self,
        cmp: &C,
        opts: &ReadOptions,
        ikey: &[u8],
        file_number: u64,
        file_size: u64,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(opts, file_number, file_size)?;
        Ok(table.get(cmp, ikey))
    }

    /// An iterator over all entries of the given file.
    pub fn new_iter<C: Comparator>(
        &self,
        cmp: C,
        opts: &ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> Result<TableIterator<C>> {
        let table = self.find_table(opts, file_number, file_size)?;
        Ok(TableIterator::new(cmp, table))
    }

    /// Drops the cached table for a file about to be deleted.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::table::TableBuilder;
    use crate::storage::mem::MemStorage;
    use crate::storage::File;
    use crate::util::comparator::BytewiseComparator;

    fn write_table(env: &MemStorage, number: u64, entries: &[(&[u8], &[u8])]) -> u64 {
        let name = generate_filename("/db", FileType::Table, number);
        let mut builder = TableBuilder::new(env.create(&name).unwrap(), BytewiseComparator);
        for (k, v) in entries {
            builder.add(k, v).unwrap();
        }
        builder.finish(true).unwrap();
        env.open(&name).unwrap().len().unwrap()
    }

    #[test]
    fn test_get_through_cache() {
        let env = MemStorage::default();
        env.mkdir_all("/db").unwrap();
        let size = write_table(&env, 7, &[(b"a", b"1"), (b"c", b"3")]);
        let cache = TableCache::new("/db".to_owned(), 16, env);
        let opts = ReadOptions::default();
        let c = BytewiseComparator;
        let (k, v) = cache.get(&c, &opts, b"b", 7, size).unwrap().unwrap();
        assert_eq!(k, b"c");
        assert_eq!(v, b"3");
        assert!(cache.get(&c, &opts, b"z", 7, size).unwrap().is_none());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let env = MemStorage::default();
        let cache = TableCache::new("/db".to_owned(), 16, env);
        let opts = ReadOptions::default();
        assert!(cache.find_table(&opts, 42, 100).is_err());
    }

    #[test]
    fn test_hit_after_evict_reopens() {
        let env = MemStorage::default();
        env.mkdir_all("/db").unwrap();
        let size = write_table(&env, 3, &[(b"k", b"v")]);
        let cache = TableCache::new("/db".to_owned(), 16, env.clone());
        let opts = ReadOptions::default();
        cache.find_table(&opts, 3, size).unwrap();
        cache.evict(3);
        // file still on disk, so the next lookup reopens it
        let c = BytewiseComparator;
        assert!(cache.get(&c, &opts, b"k", 3, size).unwrap().is_some());
        // once the file is gone an evicted table cannot come back
        cache.evict(3);
        env.remove(&generate_filename("/db", FileType::Table, 3))
            .unwrap();
        assert!(cache.find_table(&opts, 3, size).is_err());
    }

    #[test]
    fn test_no_fill_cache_leaves_cache_cold() {
        let env = MemStorage::default();
        env.mkdir_all("/db").unwrap();
        let size = write_table(&env, 9, &[(b"k", b"v")]);
        let cache = TableCache::new("/db".to_owned(), 16, env.clone());
        let opts = ReadOptions {
            fill_cache: false,
            ..Default::default()
        };
        cache.find_table(&opts, 9, size).unwrap();
        env.remove(&generate_filename("/db", FileType::Table, 9))
            .unwrap();
        // nothing was cached, so the reopen fails
        assert!(cache.find_table(&opts, 9, size).is_err());
    }
}
