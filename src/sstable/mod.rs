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

//! Table files are plain sorted runs of internal-key entries:
//!
//! ```text
//!   data:   entry*        entry := varint32 klen | key | varint32 vlen | value
//!   index:  ientry*       ientry := varint32 klen | key | fixed64 offset
//!   footer: fixed64 index_offset | fixed32 crc32c(data ++ index) | fixed64 magic
//! ```
//!
//! One index entry is written per `INDEX_SEGMENT_SIZE` data entries; its
//! key orders at or after every key of its segment and before every key
//! of the next, and its offset points at the segment's first entry. The
//! index trades precision for size and only backs offset estimates;
//! lookups binary-search the entries themselves.

pub mod table;

use crate::util::coding::{decode_fixed_32, decode_fixed_64, put_fixed_32, put_fixed_64};
use crate::{Error, Result};

/// Number of data entries covered by one index entry.
pub const INDEX_SEGMENT_SIZE: usize = 16;

pub const FOOTER_SIZE: usize = 8 + 4 + 8;

pub const TABLE_MAGIC: u64 = 0x7369_6c74_5f73_7374; // "silt_sst"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_offset: u64,
    pub checksum: u32,
}

impl Footer {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        put_fixed_64(dst, self.index_offset);
        put_fixed_32(dst, self.checksum);
        put_fixed_64(dst, TABLE_MAGIC);
    }

    pub fn decode_from(src: &[u8]) -> Result<Self> {
        if src.len() < FOOTER_SIZE {
            return Err(Error::Corruption("truncated table footer".to_owned()));
        }
        let magic = decode_fixed_64(&src[12..20]);
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(
                "not an sstable (bad magic number)".to_owned(),
            ));
        }
        Ok(Self {
            index_offset: decode_fixed_64(&src[0..8]),
            checksum: decode_fixed_32(&src[8..12]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_round_trip() {
        let footer = Footer {
            index_offset: 12345,
            checksum: 0xdead_beef,
        };
        let mut buf = vec![];
        footer.encode(&mut buf);
        assert_eq!(buf.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode_from(&buf).unwrap(), footer);
    }

    #[test]
    fn test_footer_rejects_bad_magic() {
        let footer = Footer {
            index_offset: 1,
            checksum: 2,
        };
        let mut buf = vec![];
        footer.encode(&mut buf);
        buf[15] ^= 0xff;
        assert!(Footer::decode_from(&buf).is_err());
        assert!(Footer::decode_from(&buf[..10]).is_err());
    }
}
