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

// Copyright (c) 2011 The LevelDB Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::record::{RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::storage::File;
use crate::util::coding::encode_fixed_32;
use crate::util::crc32;
use crate::Result;

/// Writes records to an underlying log `File`.
pub struct Writer<F: File> {
    dest: F,
    // current offset in the block
    block_offset: usize,
}

impl<F: File> Writer<F> {
    pub fn new(dest: F) -> Self {
        Self {
            dest,
            block_offset: 0,
        }
    }

    /// Creates a writer that continues appending to a log file already
    /// containing `initial_length` bytes of data.
    pub fn with_initial_length(dest: F, initial_length: u64) -> Self {
        Self {
            dest,
            block_offset: initial_length as usize % BLOCK_SIZE,
        }
    }

    /// Appends a slice to the log as one logical record, fragmenting it
    /// over blocks as needed.
    pub fn add_record(&mut self, s: &[u8]) -> Result<()> {
        let mut left = s.len();
        let mut begin = true;
        loop {
            assert!(
                BLOCK_SIZE >= self.block_offset,
                "[record writer] 'block_offset' {} overflows BLOCK_SIZE {}",
                self.block_offset,
                BLOCK_SIZE,
            );
            let leftover = BLOCK_SIZE - self.block_offset;
            // switch to a new block if there is not enough room left for
            // a record header
            if leftover < HEADER_SIZE {
                if leftover != 0 {
                    self.dest.write(&[0; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }
            let space = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let to_write = std::cmp::min(left, space);
            let end = to_write == left;
            let t = if begin && end {
                RecordType::Full
            } else if begin {
                RecordType::First
            } else if end {
                RecordType::Last
            } else {
                RecordType::Middle
            };
            let start = s.len() - left;
            self.write(t, &s[start..start + to_write])?;
            left -= to_write;
            begin = false;
            if left == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Flushes buffered data to the OS.
    #[inline]
    pub fn flush(&mut self) -> Result<()> {
        self.dest.flush()
    }

    /// Syncs the underlying file to the storage medium.
    #[inline]
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    // format a physical record and write it into the file
    fn write(&mut self, rt: RecordType, data: &[u8]) -> Result<()> {
        let size = data.len();
        assert!(
            size <= 0xffff,
            "[record writer] record data length {} overflows the 2 byte length field",
            size
        );
        assert!(
            self.block_offset + HEADER_SIZE + size <= BLOCK_SIZE,
            "[record writer] record [{:?}] overflows the block",
            rt,
        );
        let mut buf = [0u8; HEADER_SIZE];
        buf[4] = (size & 0xff) as u8;
        buf[5] = (size >> 8) as u8;
        buf[6] = rt as u8;
        let crc = crc32::mask(crc32::hash2(&[rt as u8], data));
        encode_fixed_32(&mut buf, crc);
        self.dest.write(&buf)?;
        self.dest.write(data)?;
        self.block_offset += HEADER_SIZE + size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::reader::Reader;
    use crate::storage::mem::MemStorage;
    use crate::storage::Storage;
    use crate::util::reporter::LogReporter;

    fn round_trip(records: Vec<Vec<u8>>) {
        let env = MemStorage::default();
        let mut writer = Writer::new(env.create("wal").unwrap());
        for r in records.iter() {
            writer.add_record(r).unwrap();
        }
        writer.flush().unwrap();
        let reporter = LogReporter::new();
        let mut reader = Reader::new(env.open("wal").unwrap(), Some(Box::new(reporter.clone())), true, 0);
        for r in records.iter() {
            assert_eq!(reader.read_record().as_deref(), Some(r.as_slice()));
        }
        assert_eq!(reader.read_record(), None);
        reporter.result().unwrap();
    }

    #[test]
    fn test_small_records() {
        round_trip(vec![b"foo".to_vec(), b"bar".to_vec(), vec![], b"baz".to_vec()]);
    }

    #[test]
    fn test_fragmented_records() {
        // spans First/Middle/Last across several blocks
        round_trip(vec![
            vec![1u8; BLOCK_SIZE - HEADER_SIZE],
            vec![2u8; BLOCK_SIZE * 3 + 17],
            b"tail".to_vec(),
        ]);
    }

    #[test]
    fn test_block_trailer_padding() {
        // leave fewer than HEADER_SIZE bytes in the first block
        let first_len = BLOCK_SIZE - HEADER_SIZE * 2 + 3;
        round_trip(vec![vec![9u8; first_len], b"next-block".to_vec()]);
    }
}
