use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::varint::{varint_len, varuint_len, VarIntBuf, VarIntBufMut};
use crate::error::CodecError;

/// Uplink is ground to vehicle, downlink is vehicle to ground
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Uplink => Direction::Downlink,
            Direction::Downlink => Direction::Uplink,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketKind {
    Unreliable = 0,
    Reliable = 1,
    Receipt = 2,
}

/// The logical channels multiplexed over a link. Each has its own sequence counters.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
pub enum StreamType {
    Firmware = 0,
    Cmd = 1,
    User = 2,
    DeviceUpdate = 3,
    Telemetry = 4,
}

impl StreamType {
    pub const COUNT: usize = 5;

    pub const ALL: [StreamType; StreamType::COUNT] = [
        StreamType::Firmware,
        StreamType::Cmd,
        StreamType::User,
        StreamType::DeviceUpdate,
        StreamType::Telemetry,
    ];

    /// dense index for per-stream arrays
    pub fn index(self) -> usize {
        u8::from(self) as usize
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub src: u64,
    pub dest: u64,
    pub direction: Direction,
    pub kind: PacketKind,
    pub stream: StreamType,
    pub counter: u16,
    /// sender's local tick count
    pub timestamp: u64,
}

impl PacketHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_varuint(self.src);
        buf.put_varuint(self.dest);
        buf.put_varint(u8::from(self.direction) as i64);
        buf.put_varint(u8::from(self.kind) as i64);
        buf.put_varint(u8::from(self.stream) as i64);
        buf.put_u16_le(self.counter);
        buf.put_varuint(self.timestamp);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<PacketHeader, CodecError> {
        let src = buf.try_get_varuint()?;
        let dest = buf.try_get_varuint()?;
        let direction = try_get_tag(buf, "direction")?;
        let kind = try_get_tag(buf, "packet kind")?;
        let stream = try_get_tag(buf, "stream type")?;
        let counter = buf.try_get_le16()?;
        let timestamp = buf.try_get_varuint()?;

        Ok(PacketHeader {
            src,
            dest,
            direction,
            kind,
            stream,
            counter,
            timestamp,
        })
    }

    pub fn serialized_len(&self) -> usize {
        varuint_len(self.src)
            + varuint_len(self.dest)
            + varint_len(u8::from(self.direction) as i64)
            + varint_len(u8::from(self.kind) as i64)
            + varint_len(u8::from(self.stream) as i64)
            + size_of::<u16>()
            + varuint_len(self.timestamp)
    }

    /// The header of a receipt answering a packet with this header: addresses are swapped, the
    ///  direction is the receiver's outbound direction, stream and counter are echoed.
    pub fn receipt_header(&self, timestamp: u64) -> PacketHeader {
        PacketHeader {
            src: self.dest,
            dest: self.src,
            direction: self.direction.opposite(),
            kind: PacketKind::Receipt,
            stream: self.stream,
            counter: self.counter,
            timestamp,
        }
    }
}

/// enum tags are zig-zag varints on the wire
pub(crate) fn try_get_tag<T: TryFromPrimitive<Primitive = u8>>(buf: &mut impl Buf, what: &'static str) -> Result<T, CodecError> {
    let raw = buf.try_get_varint()?;
    u8::try_from(raw).ok()
        .and_then(|tag| T::try_from_primitive(tag).ok())
        .ok_or(CodecError::InvalidTag { what, tag: raw })
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn header(src: u64, dest: u64, counter: u16, timestamp: u64) -> PacketHeader {
        PacketHeader {
            src,
            dest,
            direction: Direction::Downlink,
            kind: PacketKind::Reliable,
            stream: StreamType::Telemetry,
            counter,
            timestamp,
        }
    }

    #[rstest]
    #[case::small(header(1, 2, 0x0304, 5), vec![1, 2, 2, 2, 8, 0x04, 0x03, 5])]
    #[case::wide_fields(header(241, 0, 0xffff, 2288), vec![241, 1, 0, 2, 2, 8, 0xff, 0xff, 249, 0, 0])]
    fn test_ser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        header.ser(&mut buf);
        assert_eq!(buf, expected);
        assert_eq!(header.serialized_len(), expected.len());

        let mut b: &[u8] = &buf;
        assert_eq!(PacketHeader::try_deser(&mut b), Ok(header));
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::bad_direction(vec![1, 2, 4, 2, 8, 0, 0, 0], "direction", 2)]
    #[case::negative_direction(vec![1, 2, 1, 2, 8, 0, 0, 0], "direction", -1)]
    #[case::bad_kind(vec![1, 2, 2, 6, 8, 0, 0, 0], "packet kind", 3)]
    #[case::bad_stream(vec![1, 2, 2, 2, 10, 0, 0, 0], "stream type", 5)]
    fn test_invalid_tag(#[case] data: Vec<u8>, #[case] what: &'static str, #[case] tag: i64) {
        let mut b: &[u8] = &data;
        assert_eq!(PacketHeader::try_deser(&mut b), Err(CodecError::InvalidTag { what, tag }));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::no_counter(vec![1, 2, 2, 2, 8])]
    #[case::half_counter(vec![1, 2, 2, 2, 8, 0])]
    #[case::no_timestamp(vec![1, 2, 2, 2, 8, 0, 0])]
    fn test_truncated(#[case] data: Vec<u8>) {
        let mut b: &[u8] = &data;
        assert_eq!(PacketHeader::try_deser(&mut b), Err(CodecError::NotEnoughData));
    }

    #[test]
    fn test_receipt_header() {
        let receipt = header(7, 9, 123, 1000).receipt_header(55);
        assert_eq!(receipt, PacketHeader {
            src: 9,
            dest: 7,
            direction: Direction::Uplink,
            kind: PacketKind::Receipt,
            stream: StreamType::Telemetry,
            counter: 123,
            timestamp: 55,
        });
    }

    #[test]
    fn test_stream_index() {
        for (i, stream) in StreamType::ALL.iter().enumerate() {
            assert_eq!(stream.index(), i);
        }
    }
}
