//! The serving side of a blob transfer, running on the embedded endpoint without allocating.
//!
//! After a `Start`, the whole blob is sent front to back once. Ranges the requester reports
//!  missing are queued for resending, but only the part that the first pass already covered:
//!  everything behind the first pass's current position is going to be sent anyway.

use bytes::BufMut;
use sha2::Digest as _;
use sha2::Sha512;
use tracing::{debug, trace};

use crate::blob::messages::{BlobRequest, BlobResponse, Digest, DIGEST_LEN};
use crate::codec::varint::varuint_len;
use crate::config::BlobTransferConfig;
use crate::error::HandlerError;
use crate::interval_set::{FixedIntervals, Interval, IntervalSet, IntervalStorage};
use crate::packet::header::PacketHeader;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::stream::handler::StreamHandler;

pub struct BlobResponder<'a, S = FixedIntervals<8>> {
    blob: &'a [u8],
    device_name: &'a str,
    digest: Digest,
    max_segment_size: usize,
    max_outstanding_ranges: usize,

    hash_requested: bool,
    ack_pending: bool,
    /// the nonce of the running transfer
    nonce: Option<u64>,
    /// the part of the first pass that was not sent yet
    first_pass: Option<Interval>,
    resend: IntervalSet<S>,
}

impl<'a, S: IntervalStorage + Default + Clone> BlobResponder<'a, S> {
    pub fn new(blob: &'a [u8], device_name: &'a str, config: &BlobTransferConfig) -> BlobResponder<'a, S> {
        let mut digest = [0; DIGEST_LEN];
        digest.copy_from_slice(&Sha512::digest(blob));

        BlobResponder {
            blob,
            device_name,
            digest,
            max_segment_size: config.max_segment_size,
            max_outstanding_ranges: config.max_outstanding_ranges,
            hash_requested: false,
            ack_pending: false,
            nonce: None,
            first_pass: None,
            resend: IntervalSet::new(),
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// `true` while there are answers waiting to be produced
    pub fn has_answers(&self) -> bool {
        self.hash_requested || self.ack_pending || self.first_pass.is_some() || !self.resend.is_empty()
    }

    fn blob_size(&self) -> u64 {
        self.blob.len().safe_cast()
    }

    fn on_request(&mut self, request: BlobRequest) -> Result<(), HandlerError> {
        match request {
            BlobRequest::RequestHash => {
                trace!("blob hash requested");
                self.hash_requested = true;
            }
            BlobRequest::RequestChunk { start, end } => self.on_chunk_request(start, end)?,
            BlobRequest::Stop => {
                debug!("blob transfer stopped");
                self.nonce = None;
                self.ack_pending = false;
                self.first_pass = None;
                self.resend.clear();
            }
            BlobRequest::Start { nonce } => {
                self.ack_pending = true;
                if self.nonce == Some(nonce) {
                    trace!("repeated blob transfer start - acknowledging again");
                    return Ok(());
                }

                debug!("starting blob transfer with nonce {}", nonce);
                self.nonce = Some(nonce);
                self.first_pass = Some(Interval::new(0, self.blob_size()))
                    .filter(|i| !i.is_empty());
                self.resend.clear();
            }
        }
        Ok(())
    }

    fn on_chunk_request(&mut self, start: u64, end: u64) -> Result<(), HandlerError> {
        if start > end || end > self.blob_size() {
            return Err(HandlerError::PayloadRejected("requested blob range is out of bounds"));
        }

        let frontier = self.first_pass
            .map(|i| i.start())
            .unwrap_or(self.blob_size());
        if start >= frontier {
            trace!("blob range [{}, {}) is still covered by the first pass", start, end);
            return Ok(());
        }

        let range = Interval::new(start, end.min(frontier));
        let previous = self.resend.clone();
        if !self.resend.add(range) || self.resend.len() > self.max_outstanding_ranges {
            trace!("too many outstanding blob ranges - dropping request for {:?}", range);
            self.resend = previous;
        }
        Ok(())
    }

    fn produce_chunk(&mut self, out: &mut dyn BufMut) -> bool {
        let offset = match (self.resend.first(), self.first_pass) {
            (Some(range), _) | (None, Some(range)) => range.start(),
            (None, None) => return false,
        };

        let room = out.remaining_mut().saturating_sub(BlobResponse::chunk_overhead(offset));
        let max_len: u64 = room.min(self.max_segment_size).safe_cast();
        if max_len == 0 {
            return false;
        }

        let chunk = if self.resend.is_empty() {
            take_front(&mut self.first_pass, max_len)
        }
        else {
            self.resend.take_front(max_len)
        };
        let Some(chunk) = chunk else {
            return false;
        };

        let start: usize = chunk.start().prechecked_cast();
        let end: usize = chunk.end().prechecked_cast();
        BlobResponse::Chunk { offset: chunk.start(), data: &self.blob[start..end] }
            .ser(&mut &mut *out);
        true
    }
}

fn take_front(range: &mut Option<Interval>, max_len: u64) -> Option<Interval> {
    let current = (*range)?;
    let taken = Interval::new(current.start(), current.start() + max_len.min(current.len()));
    *range = Some(Interval::new(taken.end(), current.end()))
        .filter(|i| !i.is_empty());
    Some(taken)
}

impl<S: IntervalStorage + Default + Clone> StreamHandler for BlobResponder<'_, S> {
    fn handle(&mut self, _header: &PacketHeader, payload: &[u8], _response: &mut dyn BufMut) -> Result<(), HandlerError> {
        let request = BlobRequest::try_deser(payload)
            .map_err(|_| HandlerError::PayloadRejected("malformed blob request"))?;
        self.on_request(request)
    }

    /// Answers in order of priority: hash, start acknowledgement, chunks
    fn produce(&mut self, out: &mut dyn BufMut) -> bool {
        if self.hash_requested {
            let response = BlobResponse::Hash {
                total_size: self.blob_size(),
                device_name: self.device_name,
                digest: &self.digest,
            };
            if out.remaining_mut() < hash_response_len(self.blob_size(), self.device_name) {
                return false;
            }
            response.ser(&mut &mut *out);
            self.hash_requested = false;
            return true;
        }

        if self.ack_pending {
            if let Some(nonce) = self.nonce {
                BlobResponse::StartAck { nonce }.ser(&mut &mut *out);
                self.ack_pending = false;
                return true;
            }
        }

        self.produce_chunk(out)
    }
}

fn hash_response_len(total_size: u64, device_name: &str) -> usize {
    1 + varuint_len(total_size) + varuint_len(device_name.len().safe_cast()) + device_name.len() + DIGEST_LEN
}
