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
use crate::{Error, Result};
use hashbrown::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

fn norm<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().replace('\\', "/")
}

fn parent(p: &str) -> String {
    match p.rfind('/') {
        Some(idx) => p[..idx].to_owned(),
        None => "".to_owned(),
    }
}

#[derive(Clone)]
enum Node {
    Dir,
    File(FileNode),
}

#[derive(Clone)]
struct FileNode {
    data: Arc<RwLock<Vec<u8>>>,
    locked: Arc<AtomicBool>,
}

impl FileNode {
    fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(vec![])),
            locked: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A `Storage` keeping everything in process memory. Used by tests so
/// they never touch the real filesystem, and handy for ephemeral dbs.
#[derive(Clone, Default)]
pub struct MemStorage {
    tree: Arc<RwLock<HashMap<String, Node>>>,
}

impl MemStorage {
    fn err_locked<T>(r: std::result::Result<T, std::sync::PoisonError<T>>) -> T {
        match r {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        }
    }
}

impl Storage for MemStorage {
    type F = InmemFile;

    fn create<P: AsRef<Path>>(&self, name: P) -> Result<Self::F> {
        let name = norm(name);
        let mut tree = Self::err_locked(self.tree.write());
        let node = FileNode::new();
        tree.insert(name, Node::File(node.clone()));
        Ok(InmemFile { node, pos: 0 })
    }

    fn open<P: AsRef<Path>>(&self, name: P) -> Result<Self::F> {
        let name = norm(name);
        let tree = Self::err_locked(self.tree.read());
        match tree.get(&name) {
            Some(Node::File(node)) => Ok(InmemFile {
                node: node.clone(),
                pos: 0,
            }),
            _ => Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No such file: {}", name),
            ))),
        }
    }

    fn remove<P: AsRef<Path>>(&self, name: P) -> Result<()> {
        let name = norm(name);
        let mut tree = Self::err_locked(self.tree.write());
        match tree.remove(&name) {
            Some(Node::File(_)) => Ok(()),
            _ => Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No such file: {}", name),
            ))),
        }
    }

    fn remove_dir<P: AsRef<Path>>(&self, dir: P, recursively: bool) -> Result<()> {
        let dir = norm(dir);
        let mut tree = Self::err_locked(self.tree.write());
        if recursively {
            let prefix = format!("{}/", dir);
            tree.retain(|k, _| k != &dir && !k.starts_with(&prefix));
        } else {
            tree.remove(&dir);
        }
        Ok(())
    }

    fn exists<P: AsRef<Path>>(&self, name: P) -> bool {
        let name = norm(name);
        let tree = Self::err_locked(self.tree.read());
        tree.contains_key(&name)
    }

    fn rename<P: AsRef<Path>>(&self, old: P, new: P) -> Result<()> {
        let old = norm(old);
        let new = norm(new);
        let mut tree = Self::err_locked(self.tree.write());
        match tree.remove(&old) {
            Some(node) => {
                tree.insert(new, node);
                Ok(())
            }
            None => Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No such file: {}", old),
            ))),
        }
    }

    fn mkdir_all<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = norm(dir);
        let mut tree = Self::err_locked(self.tree.write());
        let mut path = String::new();
        for part in dir.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);
            tree.entry(path.clone()).or_insert(Node::Dir);
        }
        Ok(())
    }

    fn link<P: AsRef<Path>>(&self, src: P, dst: P) -> Result<()> {
        let src = norm(src);
        let dst = norm(dst);
        let mut tree = Self::err_locked(self.tree.write());
        match tree.get(&src) {
            Some(Node::File(node)) => {
                // snapshot copy, links in this storage are not aliased
                let contents = Self::err_locked(node.data.read()).clone();
                let new = FileNode::new();
                *Self::err_locked(new.data.write()) = contents;
                tree.insert(dst, Node::File(new));
                Ok(())
            }
            _ => Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No such file: {}", src),
            ))),
        }
    }

    fn list<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>> {
        let dir = norm(dir);
        let tree = Self::err_locked(self.tree.read());
        let mut res = vec![];
        for k in tree.keys() {
            if parent(k) == dir {
                res.push(PathBuf::from(k));
            }
        }
        Ok(res)
    }
}

/// A file whose contents live in an in-memory buffer shared between
/// all open handles.
pub struct InmemFile {
    node: FileNode,
    pos: u64,
}

impl File for InmemFile {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut data = MemStorage::err_locked(self.node.data.write());
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.len()?;
        let new_pos = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if new_pos < 0 {
            return Err(Error::InvalidArgument(
                "seek to a negative position".to_owned(),
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn read_all(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let data = MemStorage::err_locked(self.node.data.read());
        let start = std::cmp::min(self.pos as usize, data.len());
        buf.extend_from_slice(&data[start..]);
        let n = data.len() - start;
        self.pos = data.len() as u64;
        Ok(n)
    }

    fn len(&self) -> Result<u64> {
        Ok(MemStorage::err_locked(self.node.data.read()).len() as u64)
    }

    fn lock(&self) -> Result<()> {
        if self
            .node
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(())
        } else {
            Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "file already locked",
            )))
        }
    }

    fn unlock(&self) -> Result<()> {
        self.node.locked.store(false, Ordering::Release);
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = MemStorage::err_locked(self.node.data.read());
        if offset as usize >= data.len() {
            return Ok(0);
        }
        let end = std::cmp::min(offset as usize + buf.len(), data.len());
        let n = end - offset as usize;
        buf[..n].copy_from_slice(&data[offset as usize..end]);
        Ok(n)
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_write_read() {
        let env = MemStorage::default();
        env.mkdir_all("db").unwrap();
        let mut f = env.create("db/000001.log").unwrap();
        f.write(b"hello").unwrap();
        f.write(b" world").unwrap();
        let mut r = env.open("db/000001.log").unwrap();
        let mut buf = vec![];
        assert_eq!(r.read_all(&mut buf).unwrap(), 11);
        assert_eq!(buf, b"hello world");
        assert_eq!(r.len().unwrap(), 11);
    }

    #[test]
    fn test_shared_contents_between_handles() {
        let env = MemStorage::default();
        let mut w = env.create("f").unwrap();
        let r = env.open("f").unwrap();
        w.write(b"abc").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(r.read_at(&mut buf, 0).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_rename_remove_list() {
        let env = MemStorage::default();
        env.mkdir_all("dir").unwrap();
        env.create("dir/a").unwrap();
        env.create("dir/b").unwrap();
        let mut files = env.list("dir").unwrap();
        files.sort();
        assert_eq!(files, vec![PathBuf::from("dir/a"), PathBuf::from("dir/b")]);
        env.rename("dir/a", "dir/c").unwrap();
        assert!(!env.exists("dir/a"));
        assert!(env.exists("dir/c"));
        env.remove("dir/b").unwrap();
        assert!(env.remove("dir/b").is_err());
        env.remove_dir("dir", true).unwrap();
        assert!(!env.exists("dir"));
    }

    #[test]
    fn test_exclusive_lock() {
        let env = MemStorage::default();
        let f = env.create("LOCK").unwrap();
        f.lock().unwrap();
        let g = env.open("LOCK").unwrap();
        assert!(g.lock().is_err());
        f.unlock().unwrap();
        g.lock().unwrap();
    }
}
