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

pub mod file;
pub mod mem;

use crate::Result;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

/// `Storage` is a namespace for files.
///
/// The names are filepath names: they may be `/` separated or `\`
/// separated, depending on the underlying operating system.
///
/// `Storage` should be thread safe.
pub trait Storage: Send + Sync {
    type F: File + 'static;

    /// Creates (or truncates) a file with the given name for appending.
    fn create<P: AsRef<Path>>(&self, name: P) -> Result<Self::F>;

    /// Opens an existing file for reading.
    fn open<P: AsRef<Path>>(&self, name: P) -> Result<Self::F>;

    /// Deletes the named file.
    fn remove<P: AsRef<Path>>(&self, name: P) -> Result<()>;

    /// Removes a directory. If `recursively` is set, all its contents
    /// are removed with it.
    fn remove_dir<P: AsRef<Path>>(&self, dir: P, recursively: bool) -> Result<()>;

    /// Returns true iff the named file or directory exists.
    fn exists<P: AsRef<Path>>(&self, name: P) -> bool;

    /// Renames a file or directory to a new name, replacing the
    /// destination if it exists.
    fn rename<P: AsRef<Path>>(&self, old: P, new: P) -> Result<()>;

    /// Recursively creates a directory and all of its missing parents.
    fn mkdir_all<P: AsRef<Path>>(&self, dir: P) -> Result<()>;

    /// Makes `dst` another name for the contents of `src`, hard linking
    /// when the backend supports it and copying otherwise.
    fn link<P: AsRef<Path>>(&self, src: P, dst: P) -> Result<()>;

    /// Returns the paths of all children of the directory `dir`.
    fn list<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>>;
}

/// A file abstraction for sequential reading, random reading and
/// appending. Implementations must be safe to share between threads.
pub trait File: Send + Sync {
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flushes buffered user-space data to the operating system.
    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reads the remaining contents into `buf` and returns the number of
    /// bytes read.
    fn read_all(&mut self, buf: &mut Vec<u8>) -> Result<usize>;

    /// Returns the current length of the file.
    fn len(&self) -> Result<u64>;

    /// Locks the file for exclusive usage.
    fn lock(&self) -> Result<()>;

    fn unlock(&self) -> Result<()>;

    /// Reads bytes at the given offset without perturbing the cursor
    /// used by `read`. Returns the number of bytes read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Reads exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => break,
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
        if buf.is_empty() {
            Ok(())
        } else {
            Err(crate::Error::UnexpectedEOF)
        }
    }

    /// Syncs file contents (and the metadata needed to read them) to
    /// the storage medium.
    fn sync(&mut self) -> Result<()>;
}

/// Writes `data` into a file with the given name, syncing if asked,
/// and closes it.
pub fn do_write_string_to_file<S: Storage, P: AsRef<Path>>(
    env: &S,
    data: &str,
    file_name: P,
    should_sync: bool,
) -> Result<()> {
    let mut f = env.create(&file_name)?;
    f.write(data.as_bytes())?;
    if should_sync {
        f.sync()?;
    }
    if let Err(e) = f.close() {
        let _ = env.remove(&file_name);
        return Err(e);
    }
    Ok(())
}
