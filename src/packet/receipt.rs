use bytes::BufMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::varint::{VarIntBuf, VarIntBufMut};
use crate::error::CodecError;
use crate::packet::header::{try_get_tag, PacketHeader};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ReceiptKind {
    Ok = 0,
    /// the receiver does not handle this kind of packet
    PacketError = 1,
    /// the handler rejected the payload
    PayloadError = 2,
    CounterCorrection = 3,
}

impl ReceiptKind {
    pub fn ser(self, buf: &mut impl BufMut) {
        buf.put_varint(u8::from(self) as i64);
    }
}

/// Payload of a packet with kind `Receipt`
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Receipt<'a> {
    Ok(&'a [u8]),
    PacketError(&'a [u8]),
    PayloadError(&'a [u8]),
    /// The receiver expected a different counter. `echoed` is the header of the packet that
    ///  provoked the correction.
    CounterCorrection { expected_counter: u16, echoed: PacketHeader },
}

impl<'a> Receipt<'a> {
    pub fn kind(&self) -> ReceiptKind {
        match self {
            Receipt::Ok(_) => ReceiptKind::Ok,
            Receipt::PacketError(_) => ReceiptKind::PacketError,
            Receipt::PayloadError(_) => ReceiptKind::PayloadError,
            Receipt::CounterCorrection { .. } => ReceiptKind::CounterCorrection,
        }
    }

    /// the handler output carried by the receipt, empty for counter corrections
    pub fn data(&self) -> &'a [u8] {
        match self {
            Receipt::Ok(data) | Receipt::PacketError(data) | Receipt::PayloadError(data) => data,
            Receipt::CounterCorrection { .. } => &[],
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.kind().ser(buf);
        match self {
            Receipt::Ok(data) | Receipt::PacketError(data) | Receipt::PayloadError(data) => {
                buf.put_slice(data);
            }
            Receipt::CounterCorrection { expected_counter, echoed } => {
                buf.put_u16_le(*expected_counter);
                echoed.ser(buf);
            }
        }
    }

    pub fn try_deser(mut buf: &'a [u8]) -> Result<Receipt<'a>, CodecError> {
        let kind = try_get_tag(&mut buf, "receipt kind")?;
        Ok(match kind {
            ReceiptKind::Ok => Receipt::Ok(buf),
            ReceiptKind::PacketError => Receipt::PacketError(buf),
            ReceiptKind::PayloadError => Receipt::PayloadError(buf),
            ReceiptKind::CounterCorrection => {
                let expected_counter = buf.try_get_le16()?;
                let echoed = PacketHeader::try_deser(&mut buf)?;
                Receipt::CounterCorrection { expected_counter, echoed }
            }
        })
    }
}
