//! Compact variable-length integers as used in packet headers and sub-protocol messages.
//!
//! Unsigned values are encoded with graduated thresholds on the lead byte:
//!
//! ```ascii
//! value range             encoding
//! 0 ..= 240               [v]
//! 241 ..= 2287            [241 + (v-240) / 256, (v-240) % 256]
//! 2288 ..= 67823          [249, (v-2288) / 256, (v-2288) % 256]
//! 67824 ..= 2^24-1        [250, 3 bytes big endian]
//! ..= 2^32-1              [251, 4 bytes big endian]
//! ..= 2^40-1              [252, 5 bytes big endian]
//! ..= 2^48-1              [253, 6 bytes big endian]
//! ..= 2^56-1              [254, 7 bytes big endian]
//! ..= 2^64-1              [255, 8 bytes big endian]
//! ```
//!
//! Signed values are zig-zag mapped onto the unsigned encoding.
//!
//! NB: Decoding accepts non-canonical encodings within a width class (e.g. a small value
//!  encoded with lead byte 251), only encoding is canonical.

use bytes::{Buf, BufMut};

use crate::error::CodecError;

const ONE_BYTE_MAX: u64 = 240;
const TWO_BYTE_MAX: u64 = 2287;
const THREE_BYTE_MAX: u64 = 67823;
const THREE_BYTE_LEAD: u8 = 249;
/// lead bytes above this select a fixed width of `lead - WIDTH_BASE` trailing bytes
const WIDTH_BASE: u8 = 247;

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// number of bytes the encoding of `value` occupies
pub fn varuint_len(value: u64) -> usize {
    match value {
        0..=ONE_BYTE_MAX => 1,
        241..=TWO_BYTE_MAX => 2,
        2288..=THREE_BYTE_MAX => 3,
        _ => 1 + significant_bytes(value),
    }
}

pub fn varint_len(value: i64) -> usize {
    varuint_len(zigzag_encode(value))
}

fn significant_bytes(value: u64) -> usize {
    (64 - value.leading_zeros() as usize).div_ceil(8).max(3)
}


pub trait VarIntBuf: Buf {
    fn try_get_varuint(&mut self) -> Result<u64, CodecError> {
        let head = self.try_get_byte()?;
        match head {
            0..=240 => Ok(head as u64),
            241..=248 => {
                let low = self.try_get_byte()? as u64;
                Ok(ONE_BYTE_MAX + 256 * (head as u64 - 241) + low)
            }
            THREE_BYTE_LEAD => {
                let high = self.try_get_byte()? as u64;
                let low = self.try_get_byte()? as u64;
                Ok(TWO_BYTE_MAX + 1 + 256 * high + low)
            }
            _ => {
                let width = (head - WIDTH_BASE) as usize;
                if self.remaining() < width {
                    return Err(CodecError::NotEnoughData);
                }
                Ok(self.get_uint(width))
            }
        }
    }

    fn try_get_varint(&mut self) -> Result<i64, CodecError> {
        self.try_get_varuint()
            .map(zigzag_decode)
    }

    fn try_get_byte(&mut self) -> Result<u8, CodecError> {
        if !self.has_remaining() {
            return Err(CodecError::NotEnoughData);
        }
        Ok(self.get_u8())
    }

    /// fixed-width little endian u16, used for sequence counters and frame lengths
    fn try_get_le16(&mut self) -> Result<u16, CodecError> {
        if self.remaining() < 2 {
            return Err(CodecError::NotEnoughData);
        }
        Ok(self.get_u16_le())
    }

    fn try_get_string(&mut self) -> Result<String, CodecError> {
        let len = self.try_get_varuint()?;
        if (self.remaining() as u64) < len {
            return Err(CodecError::NotEnoughData);
        }
        let mut raw = vec![0; len as usize];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw).map_err(|e| e.utf8_error())?)
    }
}
impl<T: Buf + ?Sized> VarIntBuf for T {}


pub trait VarIntBufMut: BufMut {
    fn put_varuint(&mut self, value: u64) {
        match value {
            0..=ONE_BYTE_MAX => {
                self.put_u8(value as u8);
            }
            241..=TWO_BYTE_MAX => {
                let offs = value - ONE_BYTE_MAX;
                self.put_u8((241 + offs / 256) as u8);
                self.put_u8((offs % 256) as u8);
            }
            2288..=THREE_BYTE_MAX => {
                let offs = value - TWO_BYTE_MAX - 1;
                self.put_u8(THREE_BYTE_LEAD);
                self.put_u8((offs / 256) as u8);
                self.put_u8((offs % 256) as u8);
            }
            _ => {
                let width = significant_bytes(value);
                self.put_u8(WIDTH_BASE + width as u8);
                self.put_uint(value, width);
            }
        }
    }

    fn put_varint(&mut self, value: i64) {
        self.put_varuint(zigzag_encode(value));
    }

    fn put_string(&mut self, s: &str) {
        self.put_varuint(s.len() as u64);
        self.put_slice(s.as_bytes());
    }
}
impl<T: BufMut + ?Sized> VarIntBufMut for T {}
