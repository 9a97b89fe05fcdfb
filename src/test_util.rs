//! Utilities for testing code built on links: an observer that records events, shortcuts for
//!  building and reading frames, and an in-memory transport that loses datagrams on purpose.
//!  They are used by this crate's own tests, but they are exported for application testing as
//!  well, which is why this is regular (non-`#[cfg(test)]`) code.

use tokio::select;
use tokio::sync::mpsc;
use tokio::time;

use crate::events::{BlobEvent, LinkEvent, LinkObserver};
use crate::link::onboard::OnboardLink;
use crate::packet::frame::{self, MAX_LENGTH_VALUE};
use crate::packet::header::{Direction, PacketHeader, PacketKind, StreamType};
use crate::transport::{ByteSink, ByteSource};

pub const GROUND_ADDRESS: u64 = 1;
pub const VEHICLE_ADDRESS: u64 = 2;

#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    pub events: Vec<LinkEvent>,
}

impl RecordingObserver {
    /// returns recorded events, clearing the internal buffer
    pub fn take(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn blob_events(&self) -> Vec<BlobEvent> {
        self.events.iter()
            .filter_map(|e| match e {
                LinkEvent::Blob(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }
}

impl LinkObserver for RecordingObserver {
    fn on_event(&mut self, event: &LinkEvent) {
        self.events.push(event.clone());
    }
}

/// a packet header from the ground to the vehicle
pub fn uplink(kind: PacketKind, stream: StreamType, counter: u16, timestamp: u64) -> PacketHeader {
    PacketHeader {
        src: GROUND_ADDRESS,
        dest: VEHICLE_ADDRESS,
        direction: Direction::Uplink,
        kind,
        stream,
        counter,
        timestamp,
    }
}

/// a packet header from the vehicle to the ground
pub fn downlink(kind: PacketKind, stream: StreamType, counter: u16, timestamp: u64) -> PacketHeader {
    PacketHeader {
        src: VEHICLE_ADDRESS,
        dest: GROUND_ADDRESS,
        direction: Direction::Downlink,
        kind,
        stream,
        counter,
        timestamp,
    }
}

pub fn encode_frame(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    frame::encode_with_payload(&mut buf, header, MAX_LENGTH_VALUE, payload)
        .expect("test frame exceeds the maximum frame size");
    buf
}

/// decodes a single complete frame, panicking if it is invalid
pub fn decode_frame(raw: &[u8]) -> (PacketHeader, Vec<u8>) {
    let (header, payload) = frame::decode(raw, MAX_LENGTH_VALUE)
        .expect("invalid test frame");
    (header, payload.to_vec())
}

/// deterministic pseudo-random test data
pub fn test_blob(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect()
}

/// Which datagrams an in-memory channel loses
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Loss {
    None,
    /// every n-th datagram, starting with the n-th
    EveryNth(usize),
    /// each datagram with the given probability
    Random(f64),
}

impl Loss {
    fn drops(&self, sequence_number: usize) -> bool {
        match *self {
            Loss::None => false,
            Loss::EveryNth(n) => n > 0 && sequence_number % n == 0,
            Loss::Random(probability) => rand::random::<f64>() < probability,
        }
    }
}

/// The sending end of an in-memory channel. Every call to `send_bytes` is one datagram.
pub struct MemorySink {
    sender: mpsc::Sender<Vec<u8>>,
    loss: Loss,
    num_sent: usize,
}

#[async_trait::async_trait]
impl ByteSink for MemorySink {
    async fn send_bytes(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.num_sent += 1;
        if self.loss.drops(self.num_sent) {
            return Ok(());
        }
        // a closed receiver is a peer that is gone, like on a real network
        let _ = self.sender.send(buf.to_vec()).await;
        Ok(())
    }
}

pub struct MemorySource {
    receiver: mpsc::Receiver<Vec<u8>>,
    /// the unread rest of a datagram that was bigger than the read buffer
    rest: Vec<u8>,
}

#[async_trait::async_trait]
impl ByteSource for MemorySource {
    async fn recv_bytes(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        if self.rest.is_empty() {
            match self.receiver.recv().await {
                Some(datagram) => self.rest = datagram,
                None => return Ok(0),
            }
        }

        let len = self.rest.len().min(buf.len());
        buf[..len].copy_from_slice(&self.rest[..len]);
        self.rest.drain(..len);
        Ok(len)
    }
}

impl MemorySource {
    /// the next datagram, for tests that inspect raw output
    pub async fn recv_datagram(&mut self) -> Option<Vec<u8>> {
        if !self.rest.is_empty() {
            return Some(std::mem::take(&mut self.rest));
        }
        self.receiver.recv().await
    }

    pub fn try_recv_datagram(&mut self) -> Option<Vec<u8>> {
        if !self.rest.is_empty() {
            return Some(std::mem::take(&mut self.rest));
        }
        self.receiver.try_recv().ok()
    }
}

pub fn memory_channel(loss: Loss) -> (MemorySink, MemorySource) {
    let (sender, receiver) = mpsc::channel(1024);
    (
        MemorySink { sender, loss, num_sent: 0 },
        MemorySource { receiver, rest: Vec::new() },
    )
}

/// upper bound for the frames an embedded endpoint sends per tick, its "bandwidth"
pub const FRAMES_PER_TICK: usize = 8;

/// Runs an embedded endpoint the way its firmware main loop would: received data is fed in as
///  it arrives, and time advances in ticks. After every step pending frames are sent. Returns
///  when `done` returns `true` or the source is closed.
pub async fn drive_onboard<O: LinkObserver, const RX: usize>(
    link: &mut OnboardLink<'_, O, RX>,
    sink: &mut MemorySink,
    source: &mut MemorySource,
    mut done: impl FnMut(&OnboardLink<'_, O, RX>) -> bool,
) -> anyhow::Result<()> {
    let mut ticker = time::interval(link.config().tick_interval);
    let mut buf = [0u8; 2048];
    let mut out = Vec::new();

    while !done(&*link) {
        select! {
            received = source.recv_bytes(&mut buf) => {
                let len = received?;
                if len == 0 {
                    return Ok(());
                }
                link.accept_input(&buf[..len]);
            }
            _ = ticker.tick() => {
                link.tick();
            }
        }

        for _ in 0..FRAMES_PER_TICK {
            out.clear();
            if link.next_frame(&mut out).is_none() {
                break;
            }
            sink.send_bytes(&out).await?;
        }
    }
    Ok(())
}
