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

pub const MAX_VARINT_LEN_U32: usize = 5;
pub const MAX_VARINT_LEN_U64: usize = 10;

/// Little-endian base-128 varint encoding for u32, see
/// https://developers.google.com/protocol-buffers/docs/encoding#varints
pub struct VarintU32;

/// Little-endian base-128 varint encoding for u64.
pub struct VarintU64;

macro_rules! impl_varint {
    ($type:ty, $uint:ty, $max_len:expr) => {
        impl $type {
            /// Appends `n` varint-encoded to `dst`.
            pub fn put_varint(dst: &mut Vec<u8>, mut n: $uint) {
                while n >= 0b1000_0000 {
                    dst.push((n as u8) | 0b1000_0000);
                    n >>= 7;
                }
                dst.push(n as u8);
            }

            /// Appends the length of `src` as a varint followed by the
            /// bytes of `src` themselves.
            pub fn put_varint_prefixed_slice(dst: &mut Vec<u8>, src: &[u8]) {
                Self::put_varint(dst, src.len() as $uint);
                dst.extend_from_slice(src);
            }

            /// Decodes a varint from the head of `src`. Returns the value
            /// and the number of bytes consumed, or `None` if `src` is
            /// exhausted or the encoding overflows the target type.
            pub fn read(src: &[u8]) -> Option<($uint, usize)> {
                let mut n: $uint = 0;
                let mut shift: u32 = 0;
                for (i, &b) in src.iter().enumerate() {
                    if i >= $max_len {
                        return None;
                    }
                    if b < 0b1000_0000 {
                        return (<$uint>::from(b))
                            .checked_shl(shift)
                            .map(|v| (n | v, i + 1));
                    }
                    match (<$uint>::from(b) & 0b0111_1111).checked_shl(shift) {
                        Some(v) => n |= v,
                        None => return None,
                    }
                    shift += 7;
                }
                None
            }

            /// Decodes a varint from the head of `src` and advances `src`
            /// past the consumed bytes.
            pub fn drain_read(src: &mut &[u8]) -> Option<$uint> {
                let (n, read) = Self::read(src)?;
                *src = &src[read..];
                Some(n)
            }

            /// Decodes a varint-length-prefixed slice from the head of
            /// `src` and advances `src` past it.
            pub fn get_varint_prefixed_slice<'a>(src: &mut &'a [u8]) -> Option<&'a [u8]> {
                let len = Self::drain_read(src)? as usize;
                if src.len() < len {
                    return None;
                }
                let (res, rest) = src.split_at(len);
                *src = rest;
                Some(res)
            }
        }
    };
}

impl_varint!(VarintU32, u32, MAX_VARINT_LEN_U32);
impl_varint!(VarintU64, u64, MAX_VARINT_LEN_U64);
