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

use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282_ead8;

/// Returns the crc32c of `data`.
pub fn hash(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// Returns the crc32c of the concatenation of `a` and `b`.
pub fn hash2(a: &[u8], b: &[u8]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(a);
    digest.update(b);
    digest.finalize()
}

/// Returns a masked representation of `crc`.
///
/// Motivation: it is problematic to compute the CRC of a string that
/// contains embedded CRCs. Therefore we recommend that CRCs stored
/// somewhere (e.g., in files) should be masked before being stored.
pub fn mask(crc: u32) -> u32 {
    // Rotate right by 15 bits and add a constant.
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Returns the crc whose masked representation is `masked`.
pub fn unmask(masked: u32) -> u32 {
    masked.wrapping_sub(MASK_DELTA).rotate_left(15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_results() {
        // From rfc3720 section B.4.
        assert_eq!(0x8a91_36aa, hash(&[0u8; 32]));
        assert_eq!(0x62a8_ab43, hash(&[0xffu8; 32]));
        let mut ascending = [0u8; 32];
        for (i, b) in ascending.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(0x46dd_794e, hash(&ascending));
    }

    #[test]
    fn test_values() {
        assert_ne!(hash(b"a"), hash(b"foo"));
    }

    #[test]
    fn test_hash2_matches_concat() {
        let whole = hash(b"hello world");
        assert_eq!(whole, hash2(b"hello ", b"world"));
    }

    #[test]
    fn test_mask_round_trip() {
        let crc = hash(b"foo");
        assert_ne!(crc, mask(crc));
        assert_ne!(crc, mask(mask(crc)));
        assert_eq!(crc, unmask(mask(crc)));
        assert_eq!(crc, unmask(unmask(mask(mask(crc)))));
    }
}
