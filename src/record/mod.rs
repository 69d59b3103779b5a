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

//! The log file contents are a sequence of 32KB blocks.
//!
//! Each block consists of a sequence of records:
//!
//! ```text
//!    block := record* trailer?
//!    record :=
//!      checksum: uint32     // crc32c of type and data[] ; little-endian
//!      length: uint16       // little-endian
//!      type: uint8          // One of FULL, FIRST, MIDDLE, LAST
//!      data: uint8[length]
//! ```
//!
//! A record never starts within the last six bytes of a block (since it
//! won't fit). Any leftover bytes here form the trailer, which must
//! consist entirely of zero bytes and must be skipped by readers.

pub mod reader;
pub mod writer;

pub const BLOCK_SIZE: usize = 32768;

// checksum (4 bytes) + length (2 bytes) + type (1 byte)
pub const HEADER_SIZE: usize = 7;

pub const MAX_RECORD_TYPE: usize = RecordType::Last as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    // Zero is reserved for preallocated files
    Zero = 0,
    Full = 1,
    // For fragments
    First = 2,
    Middle = 3,
    Last = 4,
}

impl From<usize> for RecordType {
    fn from(v: usize) -> Self {
        match v {
            1 => RecordType::Full,
            2 => RecordType::First,
            3 => RecordType::Middle,
            4 => RecordType::Last,
            _ => RecordType::Zero,
        }
    }
}
