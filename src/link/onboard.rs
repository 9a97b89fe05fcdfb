//! The embedded endpoint. It is single threaded and does not allocate after construction: the
//!  caller feeds received bytes with [OnboardLink::accept_input], calls [OnboardLink::tick]
//!  periodically, and asks for outbound frames with [OnboardLink::next_frame] whenever the
//!  transport can take one.
//!
//! Retry timers are deadlines in device time, which advances by the configured tick interval
//!  on every tick.

use anyhow::bail;
use bytes::BufMut;
use tracing::{debug, trace, warn};

use crate::buffers::array_buf::ArrayBuf;
use crate::config::{EndpointRole, LinkConfig};
use crate::events::{LinkEvent, LinkObserver, LinkStats};
use crate::link::scanner::{check_header, FrameScanner};
use crate::packet::frame::{self, MAX_FRAME_LEN, MAX_LENGTH_VALUE};
use crate::packet::header::{PacketHeader, PacketKind, StreamType};
use crate::packet::receipt::{Receipt, ReceiptKind};
use crate::stream::counters::{SequenceCounter, StreamCounters};
use crate::stream::delivery::{CheckId, ReliableDelivery, TimerRequest};
use crate::stream::handler::{HandlerArray, StreamHandler};
use crate::stream::inbound::{receipt_room, InboundStream};
use crate::stream::reliable_queue::{ReceiptOutcome, ReliableQueue, Transmission};

/// Streams whose handlers are asked for unreliable payloads, in order of priority
const PRODUCERS: [StreamType; 3] = [StreamType::DeviceUpdate, StreamType::Firmware, StreamType::Telemetry];

type PayloadBuf = ArrayBuf<MAX_LENGTH_VALUE>;

struct PendingReceipt {
    header: PacketHeader,
    kind: ReceiptKind,
    payload: PayloadBuf,
}

struct OnboardStream {
    stream: StreamType,
    inbound: InboundStream<PayloadBuf>,
    /// a newer receipt replaces an unsent older one, which then counts as lost
    pending_receipt: Option<PendingReceipt>,
    queue: ReliableQueue<PayloadBuf, u32>,
    /// the queue head is due for (re)transmission
    transmission: Option<Transmission>,
    /// check id and device time of the armed retry timer
    retry_deadline: Option<(CheckId, u64)>,
    unreliable_out: SequenceCounter,
}

impl OnboardStream {
    fn new(stream: StreamType, config: &LinkConfig) -> OnboardStream {
        let initial_counter = config.reliability.initial_counter;
        OnboardStream {
            stream,
            inbound: InboundStream::new(stream, initial_counter, PayloadBuf::new()),
            pending_receipt: None,
            queue: ReliableQueue::new(stream, &config.reliability),
            transmission: None,
            retry_deadline: None,
            unreliable_out: SequenceCounter::new(initial_counter),
        }
    }

    fn schedule(&mut self, transmission: Transmission, timer: TimerRequest, now: u64) {
        self.transmission = Some(transmission);
        let delay: u64 = timer.delay.as_millis().try_into().unwrap_or(u64::MAX);
        self.retry_deadline = Some((timer.check_id, now.saturating_add(delay)));
    }

    fn on_tick(&mut self, now: u64) {
        let Some((check_id, deadline)) = self.retry_deadline else {
            return;
        };
        if deadline > now {
            return;
        }

        match self.queue.on_timer(check_id) {
            Some((transmission, timer)) => self.schedule(transmission, timer, now),
            None => self.retry_deadline = None,
        }
    }

    fn on_receipt(&mut self, header: &PacketHeader, payload: &[u8], observer: &mut impl LinkObserver, now: u64) {
        let receipt = match Receipt::try_deser(payload) {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("received invalid receipt on stream {:?} - dropping: {}", self.stream, e);
                observer.on_event(&LinkEvent::PacketDropped { header: *header, reason: "invalid receipt" });
                return;
            }
        };

        match self.queue.on_receipt(header, &receipt) {
            ReceiptOutcome::Completed { completion, kind, next } => {
                debug!("reliable packet {} on stream {:?} completed with {:?}", header.counter, self.stream, kind);
                observer.on_event(&LinkEvent::ReliableCompleted { stream: self.stream, token: completion, kind });
                match next {
                    Some((transmission, timer)) => self.schedule(transmission, timer, now),
                    None => {
                        self.transmission = None;
                        self.retry_deadline = None;
                    }
                }
            }
            ReceiptOutcome::Corrected(transmission, timer) => {
                observer.on_event(&LinkEvent::CounterCorrected { stream: self.stream, counter: transmission.counter });
                self.schedule(transmission, timer, now);
            }
            ReceiptOutcome::Ignored(reason) => {
                debug!("received receipt {} on stream {:?} - ignoring: {}", header.counter, self.stream, reason);
            }
        }
    }

    fn on_reliable(&mut self, header: &PacketHeader, payload: &[u8], handler: Option<&mut dyn StreamHandler>, max_frame_size: usize, now: u64) {
        let room = receipt_room(max_frame_size, header);
        let answer = self.inbound.on_reliable(header, payload, handler, room);

        let mut receipt = PayloadBuf::new();
        answer.ser(&mut receipt);
        if self.pending_receipt.is_some() {
            debug!("replacing unsent receipt on stream {:?}", self.stream);
        }
        self.pending_receipt = Some(PendingReceipt {
            header: header.receipt_header(now),
            kind: answer.kind(),
            payload: receipt,
        });
    }

    fn counters(&self) -> StreamCounters {
        StreamCounters {
            reliable_out: self.queue.counter(),
            unreliable_out: self.unreliable_out.get(),
            expected_reliable_in: self.inbound.expected_reliable(),
            expected_unreliable_in: self.inbound.expected_unreliable(),
        }
    }
}

/// `RX` is the size of the receive ring buffer, which must hold at least one frame of the
///  configured maximum size.
pub struct OnboardLink<'h, O, const RX: usize> {
    config: LinkConfig,
    observer: O,
    scanner: FrameScanner<[u8; RX], [u8; MAX_FRAME_LEN]>,
    handlers: HandlerArray<'h>,
    streams: [OnboardStream; StreamType::COUNT],
    /// scratch space for producers
    produced: PayloadBuf,
    /// device time in milliseconds
    now: u64,
}

impl<'h, O: LinkObserver, const RX: usize> OnboardLink<'h, O, RX> {
    pub fn new(config: LinkConfig, handlers: HandlerArray<'h>, observer: O) -> anyhow::Result<OnboardLink<'h, O, RX>> {
        config.validate()?;
        if config.role != EndpointRole::Onboard {
            bail!("an onboard link needs an onboard configuration");
        }
        let scanner = FrameScanner::new([0u8; RX], [0u8; MAX_FRAME_LEN], config.max_frame_size)?;
        let streams = StreamType::ALL.map(|stream| OnboardStream::new(stream, &config));

        Ok(OnboardLink {
            config,
            observer,
            scanner,
            handlers,
            streams,
            produced: PayloadBuf::new(),
            now: 0,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn stats(&self) -> LinkStats {
        self.scanner.stats()
    }

    pub fn counters(&self, stream: StreamType) -> StreamCounters {
        self.streams[stream.index()].counters()
    }

    /// device time in milliseconds
    pub fn now_millis(&self) -> u64 {
        self.now
    }

    pub fn tick(&mut self) {
        self.now = self.now.saturating_add(self.config.tick_interval.as_millis().try_into().unwrap_or(u64::MAX));
        for stream in &mut self.streams {
            stream.on_tick(self.now);
        }
    }

    /// Processes received bytes. Packets are handled right away, their answers are generated
    ///  by subsequent calls to [OnboardLink::next_frame].
    pub fn accept_input(&mut self, data: &[u8]) {
        self.scanner.accept_input(data);

        while let Some((header, payload)) = self.scanner.next_packet(&mut self.observer) {
            if let Err(reason) = check_header(&self.config, &header) {
                warn!("received packet {:?} - dropping: {}", header, reason);
                self.scanner.count_dropped();
                self.observer.on_event(&LinkEvent::PacketDropped { header, reason });
                continue;
            }

            let stream = &mut self.streams[header.stream.index()];
            let handler = self.handlers.get_mut(header.stream)
                .map(|h| h as &mut dyn StreamHandler);

            match header.kind {
                PacketKind::Receipt => stream.on_receipt(&header, payload, &mut self.observer, self.now),
                PacketKind::Reliable => stream.on_reliable(&header, payload, handler, self.config.max_frame_size, self.now),
                PacketKind::Unreliable if header.stream == StreamType::Cmd && payload.is_empty() => {
                    trace!("received ping");
                    stream.inbound.track_unreliable(&header);
                }
                PacketKind::Unreliable => {
                    if let Err(error) = stream.inbound.on_unreliable(&header, payload, handler) {
                        self.observer.on_event(&LinkEvent::HandlerFailed { stream: header.stream, error });
                    }
                }
            }
        }
    }

    /// Queues a reliable packet. Its completion is reported to the observer as
    ///  [LinkEvent::ReliableCompleted] with the given `token`.
    pub fn send_reliable(&mut self, stream: StreamType, payload: &[u8], token: u32) -> anyhow::Result<()> {
        let widest_header = self.header(stream, PacketKind::Reliable, 0, u64::MAX);
        if 2 + widest_header.serialized_len() + payload.len() > self.config.max_frame_size {
            bail!("reliable payload of {} bytes does not fit into a frame", payload.len());
        }
        let Some(payload) = PayloadBuf::from_slice(payload) else {
            bail!("reliable payload of {} bytes does not fit into a frame", payload.len());
        };

        let now = self.now;
        let stream_state = &mut self.streams[stream.index()];
        match stream_state.queue.enqueue(payload, now, token) {
            Ok(Some((transmission, timer))) => stream_state.schedule(transmission, timer, now),
            Ok(None) => {}
            Err(_) => bail!("reliable queue for stream {:?} is full", stream),
        }
        Ok(())
    }

    fn header(&self, stream: StreamType, kind: PacketKind, counter: u16, timestamp: u64) -> PacketHeader {
        PacketHeader {
            src: self.config.self_address,
            dest: self.config.peer_address,
            direction: self.config.role.outbound(),
            kind,
            stream,
            counter,
            timestamp,
        }
    }

    /// Appends the most urgent outbound frame to `out` and returns its length, or `None` if
    ///  there is nothing to send. `out` needs room for a frame of the configured maximum size.
    ///
    /// Receipts go first, then reliable (re)transmissions, then whatever the producing handlers
    ///  have to say.
    pub fn next_frame<B: BufMut + AsRef<[u8]> + AsMut<[u8]>>(&mut self, out: &mut B) -> Option<usize> {
        if out.remaining_mut() < frame::frame_len(self.config.max_frame_size) {
            warn!("not enough room for an outbound frame");
            return None;
        }

        let max_frame_size = self.config.max_frame_size;

        for stream in &mut self.streams {
            if let Some(receipt) = stream.pending_receipt.take() {
                let len = encode(out, &receipt.header, max_frame_size, receipt.payload.as_ref())?;
                trace!("sending receipt {} on stream {:?}", receipt.header.counter, stream.stream);
                self.observer.on_event(&LinkEvent::ReceiptSent {
                    stream: stream.stream,
                    counter: receipt.header.counter,
                    kind: receipt.kind,
                });
                return Some(len);
            }
        }

        for idx in 0..StreamType::COUNT {
            if let Some(transmission) = self.streams[idx].transmission.take() {
                let stream = StreamType::ALL[idx];
                let header = self.header(stream, PacketKind::Reliable, transmission.counter, transmission.timestamp);
                let Some(payload) = self.streams[idx].queue.head_payload() else {
                    continue;
                };
                return encode(out, &header, max_frame_size, payload.as_ref());
            }
        }

        for stream in PRODUCERS {
            let counter = self.streams[stream.index()].unreliable_out.get();
            let header = self.header(stream, PacketKind::Unreliable, counter, self.now);
            let Some(handler) = self.handlers.get_mut(stream) else {
                continue;
            };

            let room = max_frame_size.saturating_sub(2 + header.serialized_len());
            self.produced.clear();
            if handler.produce(&mut (&mut self.produced).limit(room)) {
                self.streams[stream.index()].unreliable_out.advance();
                return encode(out, &header, max_frame_size, self.produced.as_ref());
            }
        }

        None
    }
}

fn encode<B: BufMut + AsRef<[u8]> + AsMut<[u8]>>(out: &mut B, header: &PacketHeader, max_frame_size: usize, payload: &[u8]) -> Option<usize> {
    match frame::encode_with_payload(out, header, max_frame_size, payload) {
        Ok(len) => Some(len),
        Err(e) => {
            warn!("cannot encode packet on stream {:?} - dropping: {}", header.stream, e);
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use crate::blob::messages::{BlobRequest, BlobResponse};
    use crate::blob::responder::BlobResponder;
    use crate::config::BlobTransferConfig;
    use crate::error::HandlerError;
    use crate::packet::header::Direction;
    use crate::stream::handler::MockStreamHandler;
    use crate::test_util::{decode_frame, encode_frame, test_blob, uplink, RecordingObserver, GROUND_ADDRESS, VEHICLE_ADDRESS};
    use super::*;

    const RX: usize = 4096;
    const INITIAL: u16 = u16::MAX / 2;

    fn config() -> LinkConfig {
        LinkConfig::onboard(VEHICLE_ADDRESS, GROUND_ADDRESS)
    }

    fn next_packet<O: LinkObserver>(link: &mut OnboardLink<O, RX>) -> Option<(PacketHeader, Vec<u8>)> {
        let mut out = Vec::new();
        let len = link.next_frame(&mut out)?;
        assert_eq!(len, out.len());
        Some(decode_frame(&out))
    }

    fn receipt(payload: &[u8]) -> Receipt<'_> {
        Receipt::try_deser(payload).unwrap()
    }

    #[test]
    fn test_new_rejects_ground_config() {
        let result = OnboardLink::<_, RX>::new(LinkConfig::ground(VEHICLE_ADDRESS, GROUND_ADDRESS), HandlerArray::new(), RecordingObserver::default());
        assert!(result.is_err());
        let result = OnboardLink::<_, 100>::new(config(), HandlerArray::new(), RecordingObserver::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_reliable_uplink_is_executed_once() {
        let mut handler = MockStreamHandler::new();
        handler.expect_handle()
            .times(1)
            .returning(|_, payload, response| {
                assert_eq!(payload, b"arm");
                response.put_slice(b"armed");
                Ok(())
            });

        let mut link = OnboardLink::<_, RX>::new(config(), HandlerArray::new().with(StreamType::Cmd, &mut handler), RecordingObserver::default()).unwrap();
        let packet = encode_frame(&uplink(PacketKind::Reliable, StreamType::Cmd, INITIAL, 10), b"arm");

        // the second copy is a retransmission after a lost receipt
        for _ in 0..2 {
            link.accept_input(&packet);
            let (header, payload) = next_packet(&mut link).unwrap();
            assert_eq!((header.kind, header.stream, header.counter), (PacketKind::Receipt, StreamType::Cmd, INITIAL));
            assert_eq!((header.src, header.dest, header.direction), (VEHICLE_ADDRESS, GROUND_ADDRESS, Direction::Downlink));
            assert_eq!(receipt(&payload), Receipt::Ok(b"armed"));
            assert!(next_packet(&mut link).is_none());
        }
        assert_eq!(link.counters(StreamType::Cmd).expected_reliable_in, INITIAL + 1);
    }

    #[test]
    fn test_counter_mismatch_is_corrected() {
        let mut handler = MockStreamHandler::new();
        handler.expect_handle().never();

        let mut link = OnboardLink::<_, RX>::new(config(), HandlerArray::new().with(StreamType::Cmd, &mut handler), RecordingObserver::default()).unwrap();
        let sent = uplink(PacketKind::Reliable, StreamType::Cmd, 0, 10);
        link.accept_input(&encode_frame(&sent, b"arm"));

        let (header, payload) = next_packet(&mut link).unwrap();
        assert_eq!(header.counter, 0);
        assert_eq!(receipt(&payload), Receipt::CounterCorrection { expected_counter: INITIAL, echoed: sent });
        assert!(link.observer().events.contains(&LinkEvent::ReceiptSent { stream: StreamType::Cmd, counter: 0, kind: ReceiptKind::CounterCorrection }));
    }

    #[test]
    fn test_rejected_payload_does_not_advance() {
        let mut handler = MockStreamHandler::new();
        handler.expect_handle()
            .times(2)
            .returning(|_, _, _| Err(HandlerError::PayloadRejected("unknown command")));

        let mut link = OnboardLink::<_, RX>::new(config(), HandlerArray::new().with(StreamType::Cmd, &mut handler), RecordingObserver::default()).unwrap();
        let packet = encode_frame(&uplink(PacketKind::Reliable, StreamType::Cmd, INITIAL, 10), b"bogus");

        for _ in 0..2 {
            link.accept_input(&packet);
            let (_, payload) = next_packet(&mut link).unwrap();
            assert_eq!(receipt(&payload).kind(), ReceiptKind::PayloadError);
        }
        assert_eq!(link.counters(StreamType::Cmd).expected_reliable_in, INITIAL);
    }

    #[test]
    fn test_unsupported_stream() {
        let mut link = OnboardLink::<_, RX>::new(config(), HandlerArray::new(), RecordingObserver::default()).unwrap();
        link.accept_input(&encode_frame(&uplink(PacketKind::Reliable, StreamType::User, INITIAL, 10), b"x"));

        let (_, payload) = next_packet(&mut link).unwrap();
        assert_eq!(receipt(&payload), Receipt::PacketError(&[]));
    }

    #[test]
    fn test_dropped_packets() {
        let mut link = OnboardLink::<_, RX>::new(config(), HandlerArray::new(), RecordingObserver::default()).unwrap();

        let telemetry = uplink(PacketKind::Reliable, StreamType::Telemetry, INITIAL, 10);
        let wrong_direction = PacketHeader { direction: Direction::Downlink, ..uplink(PacketKind::Reliable, StreamType::Cmd, INITIAL, 10) };
        link.accept_input(&encode_frame(&telemetry, b"x"));
        link.accept_input(&encode_frame(&wrong_direction, b"x"));

        assert!(next_packet(&mut link).is_none());
        assert_eq!(link.stats().packets_dropped, 2);
        let dropped = link.observer().events.iter()
            .filter_map(|e| match e {
                LinkEvent::PacketDropped { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(dropped, vec!["telemetry is not accepted from the ground", "wrong direction"]);
    }

    #[test]
    fn test_ping_bypasses_handler() {
        let mut handler = MockStreamHandler::new();
        handler.expect_handle().never();

        let mut link = OnboardLink::<_, RX>::new(config(), HandlerArray::new().with(StreamType::Cmd, &mut handler), RecordingObserver::default()).unwrap();
        link.accept_input(&encode_frame(&uplink(PacketKind::Unreliable, StreamType::Cmd, 7, 10), b""));
        assert_eq!(link.counters(StreamType::Cmd).expected_unreliable_in, 8);
    }

    #[test]
    fn test_reliable_downlink_retransmission() {
        let mut link = OnboardLink::<_, RX>::new(config(), HandlerArray::new(), RecordingObserver::default()).unwrap();
        link.send_reliable(StreamType::User, b"status", 17).unwrap();
        link.send_reliable(StreamType::User, b"next", 18).unwrap();

        let (first, payload) = next_packet(&mut link).unwrap();
        assert_eq!((first.kind, first.counter, first.timestamp), (PacketKind::Reliable, INITIAL, 0));
        assert_eq!(payload, b"status");
        assert!(next_packet(&mut link).is_none());

        let mut retransmitted_at = Vec::new();
        for _ in 0..1200 {
            link.tick();
            if let Some((header, _)) = next_packet(&mut link) {
                assert_eq!(header, first);
                retransmitted_at.push(link.now_millis());
            }
        }
        assert_eq!(retransmitted_at, vec![1500, 4500, 10500]);

        let ground_receipt = {
            let mut buf = Vec::new();
            Receipt::Ok(&[]).ser(&mut buf);
            encode_frame(&first.receipt_header(5), &buf)
        };
        link.accept_input(&ground_receipt);
        assert!(link.observer().events.contains(&LinkEvent::ReliableCompleted { stream: StreamType::User, token: 17, kind: ReceiptKind::Ok }));

        let (second, payload) = next_packet(&mut link).unwrap();
        assert_eq!(second.counter, INITIAL + 1);
        assert_eq!(payload, b"next");
    }

    #[test]
    fn test_send_reliable_limits() {
        let mut config = config();
        config.reliability.max_queued_packets = 1;
        let mut link = OnboardLink::<_, RX>::new(config, HandlerArray::new(), RecordingObserver::default()).unwrap();

        assert!(link.send_reliable(StreamType::User, &[0; 1024], 1).is_err());
        link.send_reliable(StreamType::User, b"a", 1).unwrap();
        assert!(link.send_reliable(StreamType::User, b"b", 2).is_err());
    }

    #[test]
    fn test_frame_priorities() {
        struct Telemetry;
        impl StreamHandler for Telemetry {
            fn handle(&mut self, _header: &PacketHeader, _payload: &[u8], _response: &mut dyn BufMut) -> Result<(), HandlerError> {
                Err(HandlerError::Unsupported)
            }
            fn produce(&mut self, out: &mut dyn BufMut) -> bool {
                out.put_slice(b"altitude");
                true
            }
        }

        let mut cmd = MockStreamHandler::new();
        cmd.expect_handle().returning(|_, _, _| Ok(()));
        let mut telemetry = Telemetry;

        let handlers = HandlerArray::new()
            .with(StreamType::Cmd, &mut cmd)
            .with(StreamType::Telemetry, &mut telemetry);
        let mut link = OnboardLink::<_, RX>::new(config(), handlers, RecordingObserver::default()).unwrap();

        link.send_reliable(StreamType::User, b"status", 1).unwrap();
        link.accept_input(&encode_frame(&uplink(PacketKind::Reliable, StreamType::Cmd, INITIAL, 10), b"arm"));

        let kinds = (0..4)
            .map(|_| next_packet(&mut link).unwrap())
            .map(|(h, _)| (h.kind, h.stream, h.counter))
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec![
            (PacketKind::Receipt, StreamType::Cmd, INITIAL),
            (PacketKind::Reliable, StreamType::User, INITIAL),
            (PacketKind::Unreliable, StreamType::Telemetry, INITIAL),
            (PacketKind::Unreliable, StreamType::Telemetry, INITIAL + 1),
        ]);
    }

    #[test]
    fn test_blob_responder_as_producer() {
        let blob = test_blob(300);
        let blob_config = BlobTransferConfig::default();
        let mut responder: BlobResponder = BlobResponder::new(&blob, "uav", &blob_config);
        let digest = *responder.digest();

        let mut link = OnboardLink::<_, RX>::new(config(), HandlerArray::new().with(StreamType::Firmware, &mut responder), RecordingObserver::default()).unwrap();

        let mut request = Vec::new();
        BlobRequest::RequestHash.ser(&mut request);
        link.accept_input(&encode_frame(&uplink(PacketKind::Unreliable, StreamType::Firmware, 0, 10), &request));

        let (header, payload) = next_packet(&mut link).unwrap();
        assert_eq!((header.kind, header.stream), (PacketKind::Unreliable, StreamType::Firmware));
        assert_eq!(BlobResponse::try_deser(&payload), Ok(BlobResponse::Hash { total_size: 300, device_name: "uav", digest: &digest }));

        let mut request = Vec::new();
        BlobRequest::Start { nonce: 5 }.ser(&mut request);
        link.accept_input(&encode_frame(&uplink(PacketKind::Unreliable, StreamType::Firmware, 1, 20), &request));

        let (_, payload) = next_packet(&mut link).unwrap();
        assert_eq!(BlobResponse::try_deser(&payload), Ok(BlobResponse::StartAck { nonce: 5 }));

        let mut offsets = Vec::new();
        while let Some((_, payload)) = next_packet(&mut link) {
            let Ok(BlobResponse::Chunk { offset, data }) = BlobResponse::try_deser(&payload) else {
                panic!("expected a chunk");
            };
            assert_eq!(data, &blob[offset as usize..offset as usize + data.len()]);
            offsets.push(offset);
        }
        assert_eq!(offsets, vec![0, 128, 256]);
    }
}
