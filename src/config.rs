use std::time::Duration;

use anyhow::bail;

use crate::packet::frame::{frame_len, FRAME_OVERHEAD, MAX_LENGTH_VALUE};
use crate::packet::header::Direction;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EndpointRole {
    Ground,
    Onboard,
}

impl EndpointRole {
    pub fn outbound(self) -> Direction {
        match self {
            EndpointRole::Ground => Direction::Uplink,
            EndpointRole::Onboard => Direction::Downlink,
        }
    }

    pub fn inbound(self) -> Direction {
        self.outbound().opposite()
    }
}

#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Time to wait for a receipt before the first retransmission. Every further retransmission
    ///  doubles the wait, up to `max_backoff_factor` times this value.
    pub retry_timeout: Duration,
    pub max_backoff_factor: u32,
    /// Reliable packets queued per stream, including the one in flight. Sending fails when the
    ///  queue is full.
    pub max_queued_packets: usize,
    /// starting value for all of an endpoint's sequence counters
    pub initial_counter: u16,
}

impl ReliabilityConfig {
    pub fn max_retry_timeout(&self) -> Duration {
        self.retry_timeout * self.max_backoff_factor
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        ReliabilityConfig {
            retry_timeout: Duration::from_millis(1500),
            max_backoff_factor: 4,
            max_queued_packets: 64,
            initial_counter: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlobTransferConfig {
    /// resend interval for hash requests while waiting for the blob's hash
    pub hash_poll_interval: Duration,
    /// resend interval for the start request while waiting for its acknowledgement
    pub start_poll_interval: Duration,
    /// While transferring, missing ranges are requested again at this interval if no chunk
    ///  arrives in between
    pub check_interval: Duration,
    /// maximum number of blob bytes in a single chunk response
    pub max_segment_size: usize,
    /// number of requested ranges the responder remembers
    pub max_outstanding_ranges: usize,
    /// the requester refuses blobs announced with a bigger size
    pub max_blob_size: u64,
}

impl Default for BlobTransferConfig {
    fn default() -> Self {
        BlobTransferConfig {
            hash_poll_interval: Duration::from_millis(500),
            start_poll_interval: Duration::from_millis(500),
            check_interval: Duration::from_millis(500),
            max_segment_size: 128,
            max_outstanding_ranges: 8,
            max_blob_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub self_address: u64,
    pub peer_address: u64,
    pub role: EndpointRole,
    /// Upper bound for a frame's length field, i.e. for header and payload plus two. Frames
    ///  declaring more are treated as corrupt.
    pub max_frame_size: usize,
    /// capacity of the ring buffer collecting received bytes
    pub receive_buffer_size: usize,
    /// the ground endpoint pings a silent peer at this interval
    pub ping_interval: Duration,
    /// device time advanced by each tick of the embedded endpoint
    pub tick_interval: Duration,
    pub reliability: ReliabilityConfig,
    pub blob: BlobTransferConfig,
}

impl LinkConfig {
    pub fn ground(self_address: u64, peer_address: u64) -> LinkConfig {
        LinkConfig {
            self_address,
            peer_address,
            role: EndpointRole::Ground,
            max_frame_size: MAX_LENGTH_VALUE,
            receive_buffer_size: 16 * 1024,
            ping_interval: Duration::from_secs(1),
            tick_interval: Duration::from_millis(10),
            reliability: ReliabilityConfig::default(),
            blob: BlobTransferConfig::default(),
        }
    }

    /// The embedded endpoint starts its counters in the middle of the range, the ground
    ///  endpoint learns them through counter corrections
    pub fn onboard(self_address: u64, peer_address: u64) -> LinkConfig {
        LinkConfig {
            role: EndpointRole::Onboard,
            receive_buffer_size: 2 * frame_len(MAX_LENGTH_VALUE),
            reliability: ReliabilityConfig {
                initial_counter: u16::MAX / 2,
                ..ReliabilityConfig::default()
            },
            ..LinkConfig::ground(self_address, peer_address)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.self_address == self.peer_address {
            bail!("self address and peer address must differ");
        }
        if self.max_frame_size > MAX_LENGTH_VALUE {
            bail!("max frame size {} exceeds the protocol maximum of {}", self.max_frame_size, MAX_LENGTH_VALUE);
        }
        if self.max_frame_size < 64 {
            bail!("max frame size {} is too small", self.max_frame_size);
        }
        if self.receive_buffer_size < frame_len(self.max_frame_size) {
            bail!("receive buffer must hold at least one frame of maximum size");
        }
        if self.ping_interval.is_zero() || self.tick_interval.is_zero() {
            bail!("ping and tick intervals must be positive");
        }

        if self.reliability.retry_timeout.is_zero() {
            bail!("retry timeout must be positive");
        }
        if self.reliability.max_backoff_factor == 0 {
            bail!("max backoff factor must be at least 1");
        }
        if self.reliability.max_queued_packets == 0 {
            bail!("at least one reliable packet must fit into the send queue");
        }

        if self.blob.hash_poll_interval.is_zero() || self.blob.start_poll_interval.is_zero() || self.blob.check_interval.is_zero() {
            bail!("blob transfer intervals must be positive");
        }
        if self.blob.max_segment_size == 0 {
            bail!("blob segment size must be positive");
        }
        // a segment plus chunk tag, offset and a packet header must fit into a frame
        if self.blob.max_segment_size + 48 + FRAME_OVERHEAD > self.max_frame_size {
            bail!("blob segment size {} does not fit into frames of size {}", self.blob.max_segment_size, self.max_frame_size);
        }
        if self.blob.max_outstanding_ranges == 0 {
            bail!("the blob responder must be able to remember at least one range");
        }
        if usize::try_from(self.blob.max_blob_size).is_err() {
            bail!("max blob size {} does not fit into memory", self.blob.max_blob_size);
        }
        Ok(())
    }
}
