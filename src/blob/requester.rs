//! The downloading side of a blob transfer.
//!
//! ```ascii
//!          start()            Hash            StartAck(nonce)          last gap closed
//!  Idle ----------> AwaitingHash ----> AwaitingStart ------------> Transferring ------------> Idle
//!   ^                    |                  |                          |
//!   +--------------------+------------------+--------------------------+
//!        stop(), malformed response, digest mismatch, unchanged blob
//! ```
//!
//! Every state except `Idle` keeps one timer armed and repeats its request when the timer fires.
//!  While transferring, the timer is re-armed on every chunk, so missing ranges are only
//!  requested again when chunks stop arriving.

use bytes::Bytes;
use sha2::Digest as _;
use sha2::Sha512;
use tracing::{debug, trace, warn};

use crate::blob::messages::{BlobRequest, BlobResponse, Digest};
use crate::config::BlobTransferConfig;
use crate::events::{BlobEvent, LinkEvent, LinkObserver};
use crate::interval_set::{Interval, IntervalSet};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::stream::delivery::{CheckId, CheckIds, ReliableDelivery, TimerRequest};

struct Transfer {
    digest: Digest,
    data: Vec<u8>,
    received: IntervalSet,
}

impl Transfer {
    fn total_size(&self) -> u64 {
        self.data.len().safe_cast()
    }

    /// Stores a chunk, returning the number of bytes received so far
    fn accept(&mut self, offset: u64, chunk: &[u8]) -> Result<u64, String> {
        let total = self.total_size();
        let interval = Interval::from_len(offset, chunk.len().safe_cast())
            .filter(|i| i.end() <= total)
            .ok_or_else(|| format!("chunk at offset {} with {} bytes exceeds blob size {}", offset, chunk.len(), total))?;

        let start: usize = interval.start().prechecked_cast();
        self.data[start..start + chunk.len()].copy_from_slice(chunk);
        self.received.add(interval);
        Ok(self.received.data_size())
    }

    /// The next range to request, or `None` if the blob is complete.
    ///
    /// NB: This closes one gap at a time, always the one after the first received range. With
    ///  several gaps, the others are requested once this one is filled.
    fn next_gap(&self) -> Option<Interval> {
        let total = self.total_size();
        match self.received.as_slice() {
            [] if total == 0 => None,
            [] => Some(Interval::new(0, total)),
            [only] if only.start() == 0 && only.end() == total => None,
            [only] if only.start() == 0 => Some(Interval::new(only.end(), total)),
            [only] => Some(Interval::new(0, only.start())),
            [first, second, ..] => Some(Interval::new(first.end(), second.start())),
        }
    }
}

enum RequesterState {
    Idle,
    AwaitingHash,
    AwaitingStart { nonce: u64, transfer: Transfer },
    Transferring(Transfer),
}

pub struct BlobRequester<O> {
    config: BlobTransferConfig,
    observer: O,
    state: RequesterState,
    check_ids: CheckIds,
    armed: Option<CheckId>,
    /// digest of the last blob that was downloaded and verified
    last_digest: Option<Digest>,
}

impl<O: LinkObserver> BlobRequester<O> {
    pub fn new(config: BlobTransferConfig, observer: O) -> BlobRequester<O> {
        BlobRequester {
            config,
            observer,
            state: RequesterState::Idle,
            check_ids: CheckIds::default(),
            armed: None,
            last_digest: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, RequesterState::Idle)
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Starts a download unless one is running already
    pub fn start(&mut self) -> Option<(BlobRequest, TimerRequest)> {
        if self.is_active() {
            debug!("blob download is already running");
            return None;
        }

        debug!("starting blob download");
        self.state = RequesterState::AwaitingHash;
        self.notify(BlobEvent::Started);
        Some((BlobRequest::RequestHash, self.arm(self.config.hash_poll_interval)))
    }

    /// Cancels a running download, returning the request telling the responder to stop
    pub fn stop(&mut self) -> Option<BlobRequest> {
        if !self.is_active() {
            return None;
        }

        debug!("stopping blob download");
        self.reset();
        self.notify(BlobEvent::Stopped);
        Some(BlobRequest::Stop)
    }

    pub fn on_response(&mut self, payload: &[u8]) -> Option<(BlobRequest, TimerRequest)> {
        if !self.is_active() {
            trace!("received blob response while idle - ignoring");
            return None;
        }

        match BlobResponse::try_deser(payload) {
            Ok(BlobResponse::Hash { total_size, device_name, digest }) => self.on_hash(total_size, device_name, digest),
            Ok(BlobResponse::StartAck { nonce }) => self.on_start_ack(nonce),
            Ok(BlobResponse::Chunk { offset, data }) => self.on_chunk(offset, data),
            Ok(BlobResponse::Stop) => {
                trace!("received blob stop response");
                None
            }
            Err(e) => {
                self.fail(format!("malformed blob response: {}", e));
                None
            }
        }
    }

    fn on_hash(&mut self, total_size: u64, device_name: &str, digest: &Digest) -> Option<(BlobRequest, TimerRequest)> {
        if !matches!(self.state, RequesterState::AwaitingHash) {
            trace!("received additional hash response - ignoring");
            return None;
        }

        let len = match usize::try_from(total_size) {
            Ok(len) if total_size <= self.config.max_blob_size => len,
            _ => {
                self.fail(format!("blob size {} exceeds the maximum of {}", total_size, self.config.max_blob_size));
                return None;
            }
        };

        debug!("blob of device {:?} has {} bytes", device_name, total_size);
        self.notify(BlobEvent::SizeReceived { total: total_size, device_name: device_name.to_string() });
        self.notify(BlobEvent::HashReceived);

        if self.last_digest.as_ref() == Some(digest) {
            debug!("blob is unchanged since the last download - skipping transfer");
            self.reset();
            self.notify(BlobEvent::Skipped);
            return None;
        }

        let nonce = rand::random::<u64>();
        self.state = RequesterState::AwaitingStart {
            nonce,
            transfer: Transfer {
                digest: *digest,
                data: vec![0; len],
                received: IntervalSet::new(),
            },
        };
        Some((BlobRequest::Start { nonce }, self.arm(self.config.start_poll_interval)))
    }

    fn on_start_ack(&mut self, nonce: u64) -> Option<(BlobRequest, TimerRequest)> {
        match std::mem::replace(&mut self.state, RequesterState::Idle) {
            RequesterState::AwaitingStart { nonce: expected, transfer } if expected == nonce => {
                debug!("blob transfer acknowledged");
                self.state = RequesterState::Transferring(transfer);
                self.request_next_gap()
            }
            other => {
                trace!("received start ack with nonce {} that was not expected - ignoring", nonce);
                self.state = other;
                None
            }
        }
    }

    fn on_chunk(&mut self, offset: u64, data: &[u8]) -> Option<(BlobRequest, TimerRequest)> {
        let (accepted, total) = match &mut self.state {
            RequesterState::Transferring(transfer) => (transfer.accept(offset, data), transfer.total_size()),
            _ => {
                trace!("received blob chunk before the transfer started - ignoring");
                return None;
            }
        };

        match accepted {
            Ok(received) => {
                trace!("received blob chunk at {} with {} bytes", offset, data.len());
                self.notify(BlobEvent::Progress { received, total });
                self.request_next_gap()
            }
            Err(msg) => {
                self.fail(msg);
                None
            }
        }
    }

    fn request_next_gap(&mut self) -> Option<(BlobRequest, TimerRequest)> {
        let RequesterState::Transferring(transfer) = &self.state else {
            return None;
        };

        match transfer.next_gap() {
            Some(gap) => {
                trace!("requesting blob range {:?}", gap);
                let request = BlobRequest::RequestChunk { start: gap.start(), end: gap.end() };
                Some((request, self.arm(self.config.check_interval)))
            }
            None => {
                self.finish();
                None
            }
        }
    }

    fn finish(&mut self) {
        let RequesterState::Transferring(transfer) = std::mem::replace(&mut self.state, RequesterState::Idle) else {
            return;
        };
        self.armed = None;

        let calculated = Sha512::digest(&transfer.data);
        if calculated.as_slice() != transfer.digest.as_slice() {
            warn!("downloaded blob does not match its digest - discarding");
            self.notify(BlobEvent::Failed("digest mismatch".to_string()));
            return;
        }

        debug!("blob download finished");
        self.last_digest = Some(transfer.digest);
        self.notify(BlobEvent::Finished {
            size: transfer.total_size(),
            digest: Bytes::copy_from_slice(&transfer.digest),
            data: Bytes::from(transfer.data),
        });
    }

    fn fail(&mut self, reason: String) {
        warn!("blob download failed: {}", reason);
        self.reset();
        self.notify(BlobEvent::Failed(reason));
    }

    fn arm(&mut self, delay: std::time::Duration) -> TimerRequest {
        let check_id = self.check_ids.next();
        self.armed = Some(check_id);
        TimerRequest { check_id, delay }
    }

    fn notify(&mut self, event: BlobEvent) {
        self.observer.on_event(&LinkEvent::Blob(event));
    }
}

impl<O: LinkObserver> ReliableDelivery for BlobRequester<O> {
    type Retry = BlobRequest;

    fn on_timer(&mut self, check_id: CheckId) -> Option<(BlobRequest, TimerRequest)> {
        if self.armed != Some(check_id) {
            trace!("stale blob timer");
            return None;
        }

        let (request, delay) = match self.state {
            RequesterState::Idle => return None,
            RequesterState::AwaitingHash => (BlobRequest::RequestHash, self.config.hash_poll_interval),
            RequesterState::AwaitingStart { nonce, .. } => (BlobRequest::Start { nonce }, self.config.start_poll_interval),
            RequesterState::Transferring(_) => {
                debug!("no blob chunk within {:?} - requesting missing range", self.config.check_interval);
                return self.request_next_gap();
            }
        };
        Some((request, self.arm(delay)))
    }

    fn armed_timer(&self) -> Option<CheckId> {
        self.armed
    }

    fn reset(&mut self) {
        self.state = RequesterState::Idle;
        self.armed = None;
    }
}
