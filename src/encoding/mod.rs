//! Integer encodings shared by the on-disk formats. Fixed-width integers
//! are little-endian; lengths inside block entries use varint32.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

pub mod format;

/// Longest possible varint32 encoding.
pub const MAX_VARINT32_LEN: usize = 5;

pub fn put_fixed32(dst: &mut Vec<u8>, value: u32) {
    dst.write_u32::<LittleEndian>(value).unwrap();
}

pub fn put_fixed64(dst: &mut Vec<u8>, value: u64) {
    dst.write_u64::<LittleEndian>(value).unwrap();
}

/// Reads a little-endian u32 from the front of `src`.
pub fn decode_fixed32(src: &[u8]) -> u32 {
    LittleEndian::read_u32(src)
}

/// Reads a little-endian u64 from the front of `src`.
pub fn decode_fixed64(src: &[u8]) -> u64 {
    LittleEndian::read_u64(src)
}

/// Appends `value` in varint32 form: seven payload bits per byte, high bit
/// set on every byte except the last.
pub fn put_varint32(dst: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        dst.push((value as u8) | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

/// Writes `value` as a varint32 into the front of `dst`, returning the byte
/// count. `dst` must have room for [`MAX_VARINT32_LEN`] bytes.
pub fn write_varint32(dst: &mut [u8], mut value: u32) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        dst[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    dst[i] = value as u8;
    i + 1
}

/// Decodes a varint32 from the front of `src`, returning the value and the
/// bytes consumed. `None` if `src` ends mid-varint or the encoding does not
/// fit a u32.
pub fn get_varint32(src: &[u8]) -> Option<(u32, usize)> {
    let mut result: u64 = 0;
    for (i, &byte) in src.iter().take(MAX_VARINT32_LEN).enumerate() {
        result |= ((byte & 0x7f) as u64) << (7 * i);
        if byte < 0x80 {
            return u32::try_from(result).ok().map(|value| (value, i + 1));
        }
    }
    None
}
