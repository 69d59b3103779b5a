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
use crate::util::crc32;
use std::io::SeekFrom;

/// Notified when log reading encounters corruption.
pub trait Reporter {
    /// Some corruption was detected. `bytes` is the approximate number
    /// of bytes dropped due to the corruption.
    fn corruption(&mut self, bytes: u64, reason: &str);
}

enum ReadError {
    // Reached the end of the file (or an incomplete trailing write,
    // which recovery treats the same way).
    Eof,
    // An invalid physical record: bad crc, bad length or zero-length.
    BadRecord,
}

/// Reads logical records back from a log file written by
/// `record::writer::Writer`.
pub struct Reader<F: File> {
    file: F,
    reporter: Option<Box<dyn Reporter>>,
    checksum: bool,
    // current block
    buf: Vec<u8>,
    buf_len: usize,
    // next unread position in `buf`
    cursor: usize,
    // last `read` returned fewer than BLOCK_SIZE bytes
    eof: bool,
    // offset of the first location past the end of `buf`
    end_of_buffer_offset: u64,
    // offset of the last logical record returned
    last_record_offset: u64,
    // offset at which to start looking for the first record
    initial_offset: u64,
}

impl<F: File> Reader<F> {
    pub fn new(
        file: F,
        reporter: Option<Box<dyn Reporter>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Self {
            file,
            reporter,
            checksum,
            buf: vec![0; BLOCK_SIZE],
            buf_len: 0,
            cursor: 0,
            eof: false,
            end_of_buffer_offset: 0,
            last_record_offset: 0,
            initial_offset,
        }
    }

    /// Reads the next complete logical record. Returns `None` at the
    /// end of the file.
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }
        let mut in_fragmented_record = false;
        // offset of the logical record being assembled
        let mut prospective_record_offset = 0;
        let mut result: Vec<u8> = vec![];
        loop {
            match self.read_physical_record() {
                Ok((t, data)) => {
                    let fragment_size = data.len() as u64;
                    let physical_record_offset = self.end_of_buffer_offset
                        - self.buf_len as u64
                        + self.cursor as u64
                        - (HEADER_SIZE as u64 + fragment_size);
                    match t {
                        RecordType::Full => {
                            if in_fragmented_record {
                                self.report_corruption(
                                    result.len() as u64,
                                    "partial record without end(1)",
                                );
                            }
                            self.last_record_offset = physical_record_offset;
                            return Some(data);
                        }
                        RecordType::First => {
                            if in_fragmented_record {
                                self.report_corruption(
                                    result.len() as u64,
                                    "partial record without end(2)",
                                );
                            }
                            prospective_record_offset = physical_record_offset;
                            result.clear();
                            result.extend(data);
                            in_fragmented_record = true;
                        }
                        RecordType::Middle => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    fragment_size,
                                    "missing start of fragmented record(1)",
                                );
                            } else {
                                result.extend(data);
                            }
                        }
                        RecordType::Last => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    fragment_size,
                                    "missing start of fragmented record(2)",
                                );
                            } else {
                                result.extend(data);
                                self.last_record_offset = prospective_record_offset;
                                return Some(result);
                            }
                        }
                        RecordType::Zero => {
                            self.report_corruption(fragment_size, "unknown record type");
                        }
                    }
                }
                Err(ReadError::Eof) => {
                    // A writer dying after a First/Middle fragment but
                    // before the Last leaves a truncated logical record;
                    // that is not a corruption.
                    return None;
                }
                Err(ReadError::BadRecord) => {
                    if in_fragmented_record {
                        self.report_corruption(
                            result.len() as u64,
                            "error in middle of record",
                        );
                        in_fragmented_record = false;
                        result.clear();
                    }
                }
            }
        }
    }

    /// The offset of the last logical record returned by `read_record`.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    pub fn into_file(self) -> F {
        self.file
    }

    fn read_physical_record(&mut self) -> Result<(RecordType, Vec<u8>), ReadError> {
        loop {
            // reached the end of the block without a full header
            if self.buf_len - self.cursor < HEADER_SIZE {
                if !self.eof {
                    self.cursor = 0;
                    self.buf.resize(BLOCK_SIZE, 0);
                    match self.file.read(&mut self.buf) {
                        Ok(read) => {
                            self.end_of_buffer_offset += read as u64;
                            self.buf_len = read;
                            if read < BLOCK_SIZE {
                                self.eof = true;
                            }
                            if read == 0 {
                                return Err(ReadError::Eof);
                            }
                        }
                        Err(e) => {
                            self.report_corruption(BLOCK_SIZE as u64, &e.to_string());
                            self.eof = true;
                            return Err(ReadError::Eof);
                        }
                    }
                    continue;
                }
                // truncated header at the end of the file, caused by a
                // writer crashing mid-header; treated as a clean end
                return Err(ReadError::Eof);
            }
            let header = &self.buf[self.cursor..self.cursor + HEADER_SIZE];
            let length = (header[4] as usize) | ((header[5] as usize) << 8);
            let record_type = header[6] as usize;
            if self.cursor + HEADER_SIZE + length > self.buf_len {
                let drop_size = self.buf_len - self.cursor;
                self.cursor = self.buf_len;
                if !self.eof {
                    self.report_corruption(drop_size as u64, "bad record length");
                    return Err(ReadError::BadRecord);
                }
                // The writer died while writing the payload; not a
                // corruption.
                return Err(ReadError::Eof);
            }
            if record_type == RecordType::Zero as usize && length == 0 {
                // preallocated / zeroed trailer bytes
                self.cursor = self.buf_len;
                return Err(ReadError::BadRecord);
            }
            let data_start = self.cursor + HEADER_SIZE;
            if self.checksum {
                let expected = crc32::unmask(crate::util::coding::decode_fixed_32(header));
                // crc covers the type byte and the payload, adjacent in the block
                let actual = crc32::hash(&self.buf[self.cursor + 6..data_start + length]);
                if expected != actual {
                    let drop_size = self.buf_len - self.cursor;
                    self.cursor = self.buf_len;
                    self.report_corruption(drop_size as u64, "checksum mismatch");
                    return Err(ReadError::BadRecord);
                }
            }
            self.cursor = data_start + length;
            return Ok((
                RecordType::from(record_type),
                self.buf[data_start..data_start + length].to_vec(),
            ));
        }
    }

    fn report_corruption(&mut self, bytes: u64, reason: &str) {
        if let Some(reporter) = self.reporter.as_mut() {
            if self.end_of_buffer_offset >= bytes + self.initial_offset {
                reporter.corruption(bytes, reason);
            }
        }
    }

    // Skips all blocks entirely before `initial_offset`.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start = self.initial_offset - offset_in_block;
        // a position in the trailer belongs to the next block
        if offset_in_block > (BLOCK_SIZE - HEADER_SIZE + 1) as u64 {
            block_start += BLOCK_SIZE as u64;
        }
        self.end_of_buffer_offset = block_start;
        if block_start > 0 {
            if let Err(e) = self.file.seek(SeekFrom::Start(block_start)) {
                self.report_corruption(block_start, &e.to_string());
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::writer::Writer;
    use crate::storage::mem::MemStorage;
    use crate::storage::Storage;
    use crate::util::reporter::LogReporter;

    fn new_reader(env: &MemStorage, name: &str, reporter: &LogReporter) -> Reader<<MemStorage as Storage>::F> {
        Reader::new(
            env.open(name).unwrap(),
            Some(Box::new(reporter.clone())),
            true,
            0,
        )
    }

    #[test]
    fn test_corrupted_tail_is_eof_not_error() {
        let env = MemStorage::default();
        let mut w = Writer::new(env.create("wal").unwrap());
        w.add_record(b"complete").unwrap();
        // a torn header: write 3 bytes of garbage after the record
        let mut f = env.open("wal").unwrap();
        let mut raw = vec![];
        f.read_all(&mut raw).unwrap();
        let mut torn = env.create("wal2").unwrap();
        torn.write(&raw).unwrap();
        torn.write(&[0xde, 0xad, 0xbe]).unwrap();
        let reporter = LogReporter::new();
        let mut r = new_reader(&env, "wal2", &reporter);
        assert_eq!(r.read_record().as_deref(), Some(&b"complete"[..]));
        assert_eq!(r.read_record(), None);
        reporter.result().unwrap();
    }

    #[test]
    fn test_checksum_mismatch_reported() {
        let env = MemStorage::default();
        let mut w = Writer::new(env.create("wal").unwrap());
        w.add_record(b"record one").unwrap();
        let mut raw = vec![];
        env.open("wal").unwrap().read_all(&mut raw).unwrap();
        // flip a payload byte
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let mut broken = env.create("broken").unwrap();
        broken.write(&raw).unwrap();
        let reporter = LogReporter::new();
        let mut r = new_reader(&env, "broken", &reporter);
        assert_eq!(r.read_record(), None);
        assert!(reporter.result().is_err());
    }

    #[test]
    fn test_reads_many_records_across_blocks() {
        let env = MemStorage::default();
        let mut w = Writer::new(env.create("wal").unwrap());
        let records: Vec<Vec<u8>> = (0..100)
            .map(|i| vec![i as u8; (i * 97) % 2048])
            .collect();
        for rec in &records {
            w.add_record(rec).unwrap();
        }
        let reporter = LogReporter::new();
        let mut r = new_reader(&env, "wal", &reporter);
        for rec in &records {
            assert_eq!(r.read_record().as_deref(), Some(rec.as_slice()));
        }
        assert_eq!(r.read_record(), None);
        reporter.result().unwrap();
    }
}
