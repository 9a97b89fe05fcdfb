//! Receive side of one stream: counter checks, handler dispatch, and the receipt to answer a
//!  reliable packet with.

use bytes::BufMut;
use tracing::{debug, trace, warn};

use crate::buffers::array_buf::ArrayBuf;
use crate::codec::varint::{varuint_len, zigzag_encode};
use crate::error::HandlerError;
use crate::packet::header::{PacketHeader, StreamType};
use crate::packet::receipt::{Receipt, ReceiptKind};
use crate::stream::counters::SequenceCounter;
use crate::stream::handler::StreamHandler;

/// Storage for the most recent receipt payload
pub trait ReceiptBuf: BufMut + AsRef<[u8]> + AsMut<[u8]> {
    fn clear(&mut self);
}

impl ReceiptBuf for Vec<u8> {
    fn clear(&mut self) {
        Vec::clear(self);
    }
}

impl<const N: usize> ReceiptBuf for ArrayBuf<N> {
    fn clear(&mut self) {
        ArrayBuf::clear(self);
    }
}

/// Room for handler output in a receipt answering `header`, given the maximum length field
///  value. The receipt's timestamp is not known yet, so its maximum width is assumed.
pub fn receipt_room(max_length_value: usize, header: &PacketHeader) -> usize {
    const LENGTH_FIELD: usize = 2;
    const RECEIPT_KIND: usize = 1;
    let receipt_header_len = header.serialized_len() - varuint_len(header.timestamp) + varuint_len(u64::MAX);
    max_length_value.saturating_sub(LENGTH_FIELD + receipt_header_len + RECEIPT_KIND)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReceiptAnswer<'a> {
    /// the handler ran, or the stream is not supported
    Fresh { kind: ReceiptKind, payload: &'a [u8] },
    /// a retransmission of the most recently executed packet, answered from the cache
    Replayed(&'a [u8]),
    Correction { expected_counter: u16, echoed: PacketHeader },
}

impl ReceiptAnswer<'_> {
    pub fn kind(&self) -> ReceiptKind {
        match self {
            ReceiptAnswer::Fresh { kind, .. } => *kind,
            // only successful executions are cached
            ReceiptAnswer::Replayed(_) => ReceiptKind::Ok,
            ReceiptAnswer::Correction { .. } => ReceiptKind::CounterCorrection,
        }
    }

    /// writes the receipt payload
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            ReceiptAnswer::Fresh { payload, .. } | ReceiptAnswer::Replayed(payload) => {
                buf.put_slice(payload);
            }
            ReceiptAnswer::Correction { expected_counter, echoed } => {
                Receipt::CounterCorrection {
                    expected_counter: *expected_counter,
                    echoed: *echoed,
                }.ser(buf);
            }
        }
    }
}

pub struct InboundStream<R> {
    stream: StreamType,
    expected_reliable: SequenceCounter,
    expected_unreliable: SequenceCounter,
    /// counter and timestamp of the packet whose successful receipt is in `receipt`
    last_executed: Option<(u16, u64)>,
    receipt: R,
}

impl<R: ReceiptBuf> InboundStream<R> {
    pub fn new(stream: StreamType, initial_counter: u16, receipt_buf: R) -> InboundStream<R> {
        InboundStream {
            stream,
            expected_reliable: SequenceCounter::new(initial_counter),
            expected_unreliable: SequenceCounter::new(initial_counter),
            last_executed: None,
            receipt: receipt_buf,
        }
    }

    pub fn expected_reliable(&self) -> u16 {
        self.expected_reliable.get()
    }

    pub fn expected_unreliable(&self) -> u16 {
        self.expected_unreliable.get()
    }

    /// Records an unreliable packet that is processed outside of a handler
    pub fn track_unreliable(&mut self, header: &PacketHeader) {
        self.expected_unreliable.set(header.counter.wrapping_add(1));
    }

    /// Unreliable packets are always delivered, there is no gap detection
    pub fn on_unreliable(&mut self, header: &PacketHeader, payload: &[u8], handler: Option<&mut dyn StreamHandler>) -> Result<(), HandlerError> {
        self.track_unreliable(header);

        let Some(handler) = handler else {
            debug!("received unreliable packet on stream {:?} without handler - dropping", self.stream);
            return Err(HandlerError::Unsupported);
        };

        let mut no_response: &mut [u8] = &mut [];
        handler.handle(header, payload, &mut no_response)
    }

    /// Checks the counter and runs the handler if it matches. The counter advances only if the
    ///  handler succeeds, so a rejected packet can be sent again with the same counter.
    pub fn on_reliable(&mut self, header: &PacketHeader, payload: &[u8], handler: Option<&mut dyn StreamHandler>, response_room: usize) -> ReceiptAnswer<'_> {
        if header.counter != self.expected_reliable.get() {
            if self.last_executed == Some((header.counter, header.timestamp)) {
                debug!("received retransmission of reliable packet {} on stream {:?} - replaying its receipt", header.counter, self.stream);
                return ReceiptAnswer::Replayed(self.receipt.as_ref());
            }

            warn!("received reliable packet with counter {} on stream {:?}, expected {} - sending counter correction", header.counter, self.stream, self.expected_reliable.get());
            return ReceiptAnswer::Correction {
                expected_counter: self.expected_reliable.get(),
                echoed: *header,
            };
        }

        self.receipt.clear();
        // placeholder, all receipt kinds have a single byte encoding
        ReceiptKind::Ok.ser(&mut self.receipt);
        self.last_executed = None;

        let result = match handler {
            Some(handler) => {
                let mut response = (&mut self.receipt).limit(response_room);
                handler.handle(header, payload, &mut response)
            }
            None => Err(HandlerError::Unsupported),
        };

        let kind = match result {
            Ok(()) => {
                trace!("executed reliable packet {} on stream {:?}", header.counter, self.stream);
                self.expected_reliable.advance();
                self.last_executed = Some((header.counter, header.timestamp));
                ReceiptKind::Ok
            }
            Err(HandlerError::PayloadRejected(reason)) => {
                debug!("handler for stream {:?} rejected payload: {}", self.stream, reason);
                ReceiptKind::PayloadError
            }
            Err(HandlerError::Unsupported) => {
                debug!("reliable packet on unsupported stream {:?}", self.stream);
                ReceiptKind::PacketError
            }
        };

        self.receipt.as_mut()[0] = zigzag_encode(u8::from(kind) as i64) as u8;

        ReceiptAnswer::Fresh {
            kind,
            payload: self.receipt.as_ref(),
        }
    }
}


#[cfg(test)]
mod tests {
    use mockall::predicate::{always, eq};
    use rstest::rstest;

    use crate::packet::frame::MAX_LENGTH_VALUE;
    use crate::packet::header::{Direction, PacketKind};
    use crate::stream::handler::MockStreamHandler;
    use super::*;

    fn header(kind: PacketKind, counter: u16, timestamp: u64) -> PacketHeader {
        PacketHeader {
            src: 1,
            dest: 2,
            direction: Direction::Uplink,
            kind,
            stream: StreamType::Cmd,
            counter,
            timestamp,
        }
    }

    fn ok_handler(times: usize) -> MockStreamHandler {
        let mut handler = MockStreamHandler::new();
        handler.expect_handle()
            .times(times)
            .returning(|_, payload, response| {
                response.put_slice(b"re:");
                response.put_slice(payload);
                Ok(())
            });
        handler
    }

    fn inbound() -> InboundStream<Vec<u8>> {
        InboundStream::new(StreamType::Cmd, 0, Vec::new())
    }

    #[test]
    fn test_reliable_in_order() {
        let mut handler = ok_handler(2);
        let mut inbound = inbound();

        let answer = inbound.on_reliable(&header(PacketKind::Reliable, 0, 10), b"a", Some(&mut handler), 100);
        assert_eq!(answer, ReceiptAnswer::Fresh { kind: ReceiptKind::Ok, payload: &[0, b'r', b'e', b':', b'a'] });

        let answer = inbound.on_reliable(&header(PacketKind::Reliable, 1, 11), b"b", Some(&mut handler), 100);
        assert_eq!(answer, ReceiptAnswer::Fresh { kind: ReceiptKind::Ok, payload: &[0, b'r', b'e', b':', b'b'] });
        assert_eq!(inbound.expected_reliable(), 2);
    }

    #[rstest]
    #[case::ahead(5)]
    #[case::behind(u16::MAX)]
    fn test_reliable_counter_mismatch(#[case] counter: u16) {
        let mut handler = MockStreamHandler::new();
        handler.expect_handle().never();
        let mut inbound = inbound();

        let h = header(PacketKind::Reliable, counter, 10);
        let answer = inbound.on_reliable(&h, b"a", Some(&mut handler), 100);
        assert_eq!(answer, ReceiptAnswer::Correction { expected_counter: 0, echoed: h });
        assert_eq!(answer.kind(), ReceiptKind::CounterCorrection);
        assert_eq!(inbound.expected_reliable(), 0);
    }

    #[test]
    fn test_retransmission_is_replayed() {
        let mut handler = ok_handler(1);
        let mut inbound = inbound();

        let h = header(PacketKind::Reliable, 0, 10);
        let first = match inbound.on_reliable(&h, b"a", Some(&mut handler), 100) {
            ReceiptAnswer::Fresh { payload, .. } => payload.to_vec(),
            other => panic!("{:?}", other),
        };

        let answer = inbound.on_reliable(&h, b"a", Some(&mut handler), 100);
        assert_eq!(answer, ReceiptAnswer::Replayed(&first));
        assert_eq!(answer.kind(), ReceiptKind::Ok);

        // same counter, but a different packet
        let answer = inbound.on_reliable(&header(PacketKind::Reliable, 0, 11), b"a", Some(&mut handler), 100);
        assert!(matches!(answer, ReceiptAnswer::Correction { expected_counter: 1, .. }));
    }

    #[test]
    fn test_rejected_payload_does_not_advance() {
        let mut handler = MockStreamHandler::new();
        handler.expect_handle()
            .with(always(), eq(b"bad".as_slice()), always())
            .times(2)
            .returning(|_, _, response| {
                response.put_u8(42);
                Err(HandlerError::PayloadRejected("bad"))
            });
        let mut inbound = inbound();

        for _ in 0..2 {
            let answer = inbound.on_reliable(&header(PacketKind::Reliable, 0, 10), b"bad", Some(&mut handler), 100);
            assert_eq!(answer, ReceiptAnswer::Fresh { kind: ReceiptKind::PayloadError, payload: &[4, 42] });
        }
        assert_eq!(inbound.expected_reliable(), 0);
    }

    #[test]
    fn test_reliable_without_handler() {
        let mut inbound = inbound();
        let answer = inbound.on_reliable(&header(PacketKind::Reliable, 0, 10), b"a", None, 100);
        assert_eq!(answer, ReceiptAnswer::Fresh { kind: ReceiptKind::PacketError, payload: &[2] });
        assert_eq!(inbound.expected_reliable(), 0);
    }

    #[test]
    fn test_response_room_is_enforced() {
        let mut handler = MockStreamHandler::new();
        handler.expect_handle()
            .returning(|_, _, response| {
                assert_eq!(response.remaining_mut(), 3);
                response.put_slice(b"xyz");
                Ok(())
            });
        let mut inbound = inbound();
        let answer = inbound.on_reliable(&header(PacketKind::Reliable, 0, 10), b"a", Some(&mut handler), 3);
        assert_eq!(answer, ReceiptAnswer::Fresh { kind: ReceiptKind::Ok, payload: &[0, b'x', b'y', b'z'] });
    }

    #[rstest]
    #[case::first(0, 1)]
    #[case::gap(17, 18)]
    #[case::wraps(u16::MAX, 0)]
    fn test_unreliable_always_delivered(#[case] counter: u16, #[case] expected_next: u16) {
        let mut handler = MockStreamHandler::new();
        handler.expect_handle()
            .times(1)
            .returning(|_, _, response| {
                assert_eq!(response.remaining_mut(), 0);
                Ok(())
            });
        let mut inbound = inbound();
        assert_eq!(inbound.on_unreliable(&header(PacketKind::Unreliable, counter, 0), b"tm", Some(&mut handler)), Ok(()));
        assert_eq!(inbound.expected_unreliable(), expected_next);
    }

    #[test]
    fn test_receipt_answer_ser() {
        let mut buf = Vec::new();
        let h = header(PacketKind::Reliable, 3, 4);
        ReceiptAnswer::Correction { expected_counter: 1, echoed: h }.ser(&mut buf);
        assert_eq!(Receipt::try_deser(&buf), Ok(Receipt::CounterCorrection { expected_counter: 1, echoed: h }));
    }

    #[test]
    fn test_receipt_room() {
        let h = header(PacketKind::Reliable, 3, 4);
        // header is 8 bytes with a one byte timestamp, 16 with the widest one
        assert_eq!(receipt_room(MAX_LENGTH_VALUE, &h), MAX_LENGTH_VALUE - 2 - 16 - 1);
        assert_eq!(receipt_room(10, &h), 0);
    }
}
