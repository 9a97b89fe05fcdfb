//! Finds frames in a stream of received bytes.
//!
//! The scanner makes no assumptions about where transport reads begin or end. Bytes are collected
//!  in a ring buffer and searched for the separator, across the buffer's wrap-around if necessary.
//!  A candidate frame that fails validation costs a single byte, and scanning resumes right after
//!  its first separator byte. So a bogus separator in the middle of junk can not swallow a real
//!  frame that follows it.

use anyhow::bail;
use tracing::{debug, trace};

use crate::buffers::ring_buffer::RingBuffer;
use crate::config::{EndpointRole, LinkConfig};
use crate::error::FrameError;
use crate::events::{LinkEvent, LinkObserver, LinkStats};
use crate::packet::frame::{self, frame_len, SEPARATOR};
use crate::packet::header::{PacketHeader, StreamType};

pub struct FrameScanner<R, F> {
    ring: RingBuffer<R>,
    /// a received frame is copied here to get it into contiguous memory
    scratch: F,
    max_length_value: usize,
    stats: LinkStats,
}

impl<R: AsRef<[u8]> + AsMut<[u8]>, F: AsRef<[u8]> + AsMut<[u8]>> FrameScanner<R, F> {
    pub fn new(ring_storage: R, scratch: F, max_length_value: usize) -> anyhow::Result<FrameScanner<R, F>> {
        let min_len = frame_len(max_length_value);
        if ring_storage.as_ref().len() < min_len {
            bail!("receive buffer of {} bytes can not hold a frame of {} bytes", ring_storage.as_ref().len(), min_len);
        }
        if scratch.as_ref().len() < min_len {
            bail!("scratch buffer of {} bytes can not hold a frame of {} bytes", scratch.as_ref().len(), min_len);
        }

        Ok(FrameScanner {
            ring: RingBuffer::new(ring_storage),
            scratch,
            max_length_value,
            stats: LinkStats::default(),
        })
    }

    pub fn accept_input(&mut self, data: &[u8]) {
        trace!("received {} bytes", data.len());
        self.ring.write(data);
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// for packets that were decoded but then refused by the link
    pub fn count_dropped(&mut self) {
        self.stats.packets_dropped += 1;
    }

    pub fn buffered_len(&self) -> usize {
        self.ring.readable_len()
    }

    /// Returns the next valid frame's header and payload, or `None` if no complete frame is
    ///  buffered. Junk and invalid frames are consumed and reported along the way.
    pub fn next_packet(&mut self, observer: &mut impl LinkObserver) -> Option<(PacketHeader, &[u8])> {
        let (header, payload_start, payload_end) = loop {
            match self.find_separator() {
                Ok(0) => {}
                Ok(junk) => {
                    self.skip_junk(junk, observer);
                }
                Err(junk) => {
                    if junk > 0 {
                        self.skip_junk(junk, observer);
                    }
                    return None;
                }
            }

            let mut raw_length = [0u8; 2];
            if self.ring.peek(SEPARATOR.len(), &mut raw_length).is_err() {
                return None;
            }

            let declared = frame::read_length_value(&raw_length);
            if declared > self.max_length_value {
                self.reject(FrameError::Oversized { declared, max: self.max_length_value }, 1, observer);
                continue;
            }

            let total = frame_len(declared);
            if self.ring.readable_len() < total {
                trace!("waiting for the rest of a {} byte frame", total);
                return None;
            }

            let candidate = &mut self.scratch.as_mut()[..total];
            if self.ring.peek(0, candidate).is_err() {
                return None;
            }

            match frame::decode(&self.scratch.as_ref()[..total], self.max_length_value) {
                Ok((header, payload)) => {
                    let payload_end = total - 2;
                    let payload_start = payload_end - payload.len();
                    self.ring.erase(total);
                    self.stats.frames_accepted += 1;
                    break (header, payload_start, payload_end);
                }
                Err(e @ FrameError::InvalidHeader(_)) => {
                    // the checksum matched, so these bytes were sent as a frame
                    self.reject(e, total, observer);
                }
                Err(e) => {
                    self.reject(e, 1, observer);
                }
            }
        };

        trace!("received frame: {:?}", header);
        observer.on_event(&LinkEvent::PacketReceived(header));
        Some((header, &self.scratch.as_ref()[payload_start..payload_end]))
    }

    /// `Ok` with the separator's offset, or `Err` with the number of bytes that can be discarded
    ///  because no separator starts there. A trailing first separator byte is kept.
    fn find_separator(&self) -> Result<usize, usize> {
        let (first, second) = self.ring.readable_chunks();

        let mut prev = None;
        for (idx, &byte) in first.iter().chain(second).enumerate() {
            if prev == Some(SEPARATOR[0]) && byte == SEPARATOR[1] {
                return Ok(idx - 1);
            }
            prev = Some(byte);
        }

        match prev {
            Some(b) if b == SEPARATOR[0] => Err(self.ring.readable_len() - 1),
            _ => Err(self.ring.readable_len()),
        }
    }

    fn skip_junk(&mut self, len: usize, observer: &mut impl LinkObserver) {
        debug!("skipping {} bytes of junk", len);
        self.ring.erase(len);
        self.stats.junk_bytes += len as u64;
        observer.on_event(&LinkEvent::Junk { len });
    }

    fn reject(&mut self, error: FrameError, erase: usize, observer: &mut impl LinkObserver) {
        debug!("received invalid frame - dropping: {}", error);
        self.ring.erase(erase);
        self.stats.frames_rejected += 1;
        observer.on_event(&LinkEvent::FrameRejected(error));
    }
}

/// Protocol level checks of a decoded packet's header: addresses, direction, and streams the
///  endpoint's peer may not use. Returns the reason for refusing a packet.
pub fn check_header(config: &LinkConfig, header: &PacketHeader) -> Result<(), &'static str> {
    if header.src != config.peer_address {
        return Err("unknown source address");
    }
    if header.dest != config.self_address {
        return Err("not addressed to this endpoint");
    }
    if header.direction != config.role.inbound() {
        return Err("wrong direction");
    }
    if config.role == EndpointRole::Onboard && header.stream == StreamType::Telemetry {
        return Err("telemetry is not accepted from the ground");
    }
    Ok(())
}
