//! Wire framing of a single packet:
//!
//! ```ascii
//! 0: separator 0x9c 0x3e
//! 2: length (u16 LE) = 2 + header length + payload length
//! 4: header (see PacketHeader)
//! *: payload
//! *: checksum (u16 LE), CRC over everything from the length field to the end of the payload
//! ```

use bytes::BufMut;

use crate::error::FrameError;
use crate::packet::checksum::Checksum;
use crate::packet::header::PacketHeader;
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const SEPARATOR: [u8; 2] = [0x9c, 0x3e];

/// upper bound for the length field
pub const MAX_LENGTH_VALUE: usize = 1024;

const LENGTH_OFFSET: usize = SEPARATOR.len();
const HEADER_OFFSET: usize = LENGTH_OFFSET + size_of::<u16>();
const CHECKSUM_LEN: usize = size_of::<u16>();

/// separator, length and checksum
pub const FRAME_OVERHEAD: usize = HEADER_OFFSET + CHECKSUM_LEN;

/// full frame length for a given length field value
pub fn frame_len(length_value: usize) -> usize {
    length_value + SEPARATOR.len() + CHECKSUM_LEN
}

pub const MAX_FRAME_LEN: usize = MAX_LENGTH_VALUE + SEPARATOR.len() + CHECKSUM_LEN;

/// Appends a frame to `buf`, letting `write_payload` write the payload directly into the buffer
///  after the header. Returns the frame's length.
///
/// If the result exceeds `max_length_value`, `Oversized` is returned and `buf` contains a partial
///  frame that the caller must discard.
pub fn encode<B>(buf: &mut B, header: &PacketHeader, max_length_value: usize, write_payload: impl FnOnce(&mut B)) -> Result<usize, FrameError>
where B: BufMut + AsRef<[u8]> + AsMut<[u8]>
{
    let start = buf.as_ref().len();

    buf.put_slice(&SEPARATOR);
    buf.put_u16_le(0);
    header.ser(buf);
    write_payload(buf);

    let length_value = buf.as_ref().len() - start - SEPARATOR.len();
    if length_value > max_length_value {
        return Err(FrameError::Oversized { declared: length_value, max: max_length_value });
    }

    let length_value_u16: u16 = length_value.prechecked_cast();
    buf.as_mut()[start + LENGTH_OFFSET .. start + HEADER_OFFSET].copy_from_slice(&length_value_u16.to_le_bytes());

    let checksum = Checksum::new(&buf.as_ref()[start + LENGTH_OFFSET ..]);
    buf.put_u16_le(checksum.0);

    Ok(frame_len(length_value))
}

pub fn encode_with_payload<B>(buf: &mut B, header: &PacketHeader, max_length_value: usize, payload: &[u8]) -> Result<usize, FrameError>
where B: BufMut + AsRef<[u8]> + AsMut<[u8]>
{
    encode(buf, header, max_length_value, |buf| buf.put_slice(payload))
}

/// Decodes exactly one complete frame. The checksum is verified before any header field is
///  parsed, and the bytes after the header are returned as the payload.
pub fn decode(frame: &[u8], max_length_value: usize) -> Result<(PacketHeader, &[u8]), FrameError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(FrameError::TooShort(frame.len()));
    }
    if frame[..LENGTH_OFFSET] != SEPARATOR {
        return Err(FrameError::BadSeparator);
    }

    let declared = read_length_value(&frame[LENGTH_OFFSET..HEADER_OFFSET]);
    if declared > max_length_value {
        return Err(FrameError::Oversized { declared, max: max_length_value });
    }
    let actual = frame.len() - SEPARATOR.len() - CHECKSUM_LEN;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }

    let checksum_offset = frame.len() - CHECKSUM_LEN;
    let received = Checksum(u16::from_le_bytes([frame[checksum_offset], frame[checksum_offset + 1]]));
    let calculated = Checksum::new(&frame[LENGTH_OFFSET..checksum_offset]);
    if received != calculated {
        return Err(FrameError::ChecksumMismatch { received, calculated });
    }

    let mut body = &frame[HEADER_OFFSET..checksum_offset];
    let header = PacketHeader::try_deser(&mut body)
        .map_err(FrameError::InvalidHeader)?;
    Ok((header, body))
}

/// `raw` must hold exactly the two bytes of the length field
pub fn read_length_value(raw: &[u8]) -> usize {
    u16::from_le_bytes([raw[0], raw[1]]).safe_cast()
}
