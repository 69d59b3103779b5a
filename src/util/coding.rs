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

/// Encodes `value` in little-endian into the first 4 bytes of `dst`.
///
/// # Panics
///
/// Panics if `dst.len()` is less than 4.
pub fn encode_fixed_32(dst: &mut [u8], value: u32) {
    dst[..4].copy_from_slice(&value.to_le_bytes());
}

/// Encodes `value` in little-endian into the first 8 bytes of `dst`.
///
/// # Panics
///
/// Panics if `dst.len()` is less than 8.
pub fn encode_fixed_64(dst: &mut [u8], value: u64) {
    dst[..8].copy_from_slice(&value.to_le_bytes());
}

/// Decodes the first 4 bytes of `src` as a little-endian u32.
/// Returns 0 if `src` is shorter than 4 bytes.
pub fn decode_fixed_32(src: &[u8]) -> u32 {
    if src.len() < 4 {
        let mut buf = [0u8; 4];
        buf[..src.len()].copy_from_slice(src);
        return u32::from_le_bytes(buf);
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[..4]);
    u32::from_le_bytes(buf)
}

/// Decodes the first 8 bytes of `src` as a little-endian u64.
/// Returns 0 if `src` is shorter than 8 bytes.
pub fn decode_fixed_64(src: &[u8]) -> u64 {
    if src.len() < 8 {
        let mut buf = [0u8; 8];
        buf[..src.len()].copy_from_slice(src);
        return u64::from_le_bytes(buf);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    u64::from_le_bytes(buf)
}

/// Appends `value` as 4 little-endian bytes to `dst`.
pub fn put_fixed_32(dst: &mut Vec<u8>, value: u32) {
    dst.extend_from_slice(&value.to_le_bytes());
}

/// Appends `value` as 8 little-endian bytes to `dst`.
pub fn put_fixed_64(dst: &mut Vec<u8>, value: u64) {
    dst.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_32_round_trip() {
        let tests: Vec<(u32, Vec<u8>)> = vec![
            (0, vec![0, 0, 0, 0]),
            (1, vec![1, 0, 0, 0]),
            (255, vec![255, 0, 0, 0]),
            (256, vec![0, 1, 0, 0]),
            (512, vec![0, 2, 0, 0]),
            (u32::MAX, vec![255, 255, 255, 255]),
        ];
        for (input, expect) in tests {
            let mut dst = vec![0u8; 4];
            encode_fixed_32(&mut dst, input);
            assert_eq!(dst, expect);
            assert_eq!(decode_fixed_32(&dst), input);
        }
    }

    #[test]
    fn test_fixed_64_round_trip() {
        for input in [0u64, 1, 255, 256, 1 << 33, u64::MAX] {
            let mut dst = vec![0u8; 8];
            encode_fixed_64(&mut dst, input);
            assert_eq!(decode_fixed_64(&dst), input);
            let mut v = vec![];
            put_fixed_64(&mut v, input);
            assert_eq!(v, dst);
        }
    }

    #[test]
    fn test_decode_short_input() {
        assert_eq!(decode_fixed_32(&[1, 0]), 1);
        assert_eq!(decode_fixed_64(&[2]), 2);
    }
}
