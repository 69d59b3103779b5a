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

use crate::storage::{File, Storage};
use crate::Result;
use fs2::FileExt;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The operating system filesystem.
#[derive(Clone, Copy, Default)]
pub struct FileStorage;

impl Storage for FileStorage {
    type F = SystemFile;

    fn create<P: AsRef<Path>>(&self, name: P) -> Result<Self::F> {
        let inner = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .read(true)
            .open(name)?;
        Ok(SystemFile { inner })
    }

    fn open<P: AsRef<Path>>(&self, name: P) -> Result<Self::F> {
        let inner = fs::OpenOptions::new().read(true).open(name)?;
        Ok(SystemFile { inner })
    }

    fn remove<P: AsRef<Path>>(&self, name: P) -> Result<()> {
        fs::remove_file(name)?;
        Ok(())
    }

    fn remove_dir<P: AsRef<Path>>(&self, dir: P, recursively: bool) -> Result<()> {
        if recursively {
            fs::remove_dir_all(dir)?;
        } else {
            fs::remove_dir(dir)?;
        }
        Ok(())
    }

    fn exists<P: AsRef<Path>>(&self, name: P) -> bool {
        name.as_ref().exists()
    }

    fn rename<P: AsRef<Path>>(&self, old: P, new: P) -> Result<()> {
        fs::rename(old, new)?;
        Ok(())
    }

    fn mkdir_all<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        fs::create_dir_all(dir)?;
        Ok(())
    }

    fn link<P: AsRef<Path>>(&self, src: P, dst: P) -> Result<()> {
        if fs::hard_link(&src, &dst).is_err() {
            fs::copy(&src, &dst)?;
        }
        Ok(())
    }

    fn list<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let mut v = vec![];
        for entry in fs::read_dir(dir)? {
            v.push(entry?.path());
        }
        Ok(v)
    }
}

/// A file on the operating system filesystem.
pub struct SystemFile {
    inner: fs::File,
}

impl File for SystemFile {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.inner.write(buf)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.inner.flush()?)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.inner.seek(pos)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.inner.read(buf)?)
    }

    fn read_all(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        Ok(self.inner.read_to_end(buf)?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn lock(&self) -> Result<()> {
        Ok(self.inner.try_lock_exclusive()?)
    }

    fn unlock(&self) -> Result<()> {
        Ok(FileExt::unlock(&self.inner)?)
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(std::os::unix::fs::FileExt::read_at(
            &self.inner,
            buf,
            offset,
        )?)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(std::os::windows::fs::FileExt::seek_read(
            &self.inner,
            buf,
            offset,
        )?)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(self.inner.sync_all()?)
    }
}
