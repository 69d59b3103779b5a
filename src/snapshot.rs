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

use std::sync::Arc;

/// An immutable handle to a particular state of the db. Reads through
/// a snapshot never observe writes sequenced after it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Snapshot {
    sequence_number: u64,
}

impl Snapshot {
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence_number
    }
}

impl From<u64> for Snapshot {
    fn from(sequence_number: u64) -> Self {
        Self { sequence_number }
    }
}

/// All snapshots currently alive, oldest first.
///
/// Liveness is tracked through `Arc` strong counts: a snapshot whose
/// only owner is the list itself is dead and swept by `gc`.
#[derive(Default)]
pub struct SnapshotList {
    snapshots: Vec<Arc<Snapshot>>,
}

impl SnapshotList {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Creates (or revives) the snapshot for `seq` and appends it to
    /// the list if it is not the current newest.
    pub fn acquire(&mut self, seq: u64) -> Arc<Snapshot> {
        if let Some(last) = self.snapshots.last() {
            assert!(
                last.sequence() <= seq,
                "snapshot sequence numbers must be monotonic: {} then {}",
                last.sequence(),
                seq,
            );
            if last.sequence() == seq {
                return last.clone();
            }
        }
        let s = Arc::new(Snapshot::from(seq));
        self.snapshots.push(s.clone());
        s
    }

    /// The sequence number of the oldest live snapshot.
    ///
    /// # Panics
    ///
    /// Panics if the list is empty.
    pub fn oldest(&self) -> u64 {
        self.snapshots.first().map(|s| s.sequence()).unwrap()
    }

    /// The sequence number of the newest live snapshot.
    ///
    /// # Panics
    ///
    /// Panics if the list is empty.
    pub fn newest(&self) -> u64 {
        self.snapshots.last().map(|s| s.sequence()).unwrap()
    }

    /// Drops the given snapshot handle from the list. Returns false if
    /// it was not present (released twice).
    pub fn release(&mut self, snapshot: Arc<Snapshot>) -> bool {
        if let Some(idx) = self
            .snapshots
            .iter()
            .position(|s| Arc::ptr_eq(s, &snapshot))
        {
            self.snapshots.remove(idx);
            return true;
        }
        false
    }

    /// Sweeps snapshots no longer referenced outside the list.
    pub fn gc(&mut self) {
        self.snapshots.retain(|s| Arc::strong_count(s) > 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_monotonic_and_dedups() {
        let mut list = SnapshotList::default();
        assert!(list.is_empty());
        let s1 = list.acquire(1);
        let s2 = list.acquire(5);
        let s3 = list.acquire(5);
        assert!(Arc::ptr_eq(&s2, &s3));
        assert_eq!(list.oldest(), 1);
        assert_eq!(list.newest(), 5);
        drop((s1, s2, s3));
    }

    #[test]
    #[should_panic]
    fn test_acquire_rejects_going_backwards() {
        let mut list = SnapshotList::default();
        let _s = list.acquire(9);
        let _ = list.acquire(3);
    }

    #[test]
    fn test_release() {
        let mut list = SnapshotList::default();
        let s1 = list.acquire(1);
        let s2 = list.acquire(2);
        assert!(list.release(s1));
        assert_eq!(list.oldest(), 2);
        assert!(list.release(s2.clone()));
        assert!(!list.release(s2));
        assert!(list.is_empty());
    }

    #[test]
    fn test_gc_sweeps_unreferenced() {
        let mut list = SnapshotList::default();
        let s1 = list.acquire(1);
        {
            let _s2 = list.acquire(2);
            let _s3 = list.acquire(3);
        }
        list.gc();
        assert_eq!(list.oldest(), 1);
        assert_eq!(list.newest(), 1);
        drop(s1);
        list.gc();
        assert!(list.is_empty());
    }
}
