//! Send side of a stream's reliable traffic.
//!
//! Packets wait in a FIFO, and only the head is in flight: it is (re)transmitted until a
//!  matching receipt arrives, then the next one goes out. The head's counter is assigned when it
//!  is transmitted, so a counter correction simply changes what the next transmission carries.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::ReliabilityConfig;
use crate::packet::header::{PacketHeader, StreamType};
use crate::packet::receipt::{Receipt, ReceiptKind};
use crate::stream::counters::SequenceCounter;
use crate::stream::delivery::{CheckId, CheckIds, ReliableDelivery, TimerRequest};

struct QueuedPacket<P, C> {
    payload: P,
    /// sender time when the packet was queued, carried by every transmission of it
    timestamp: u64,
    completion: C,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SendState {
    Idle,
    AwaitingReceipt { check_id: CheckId, timeout: Duration },
}

/// Instruction to send the queue's head with these header fields
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Transmission {
    pub counter: u16,
    pub timestamp: u64,
}

#[derive(Debug)]
pub enum ReceiptOutcome<C> {
    /// The head packet was answered and removed. If another packet is queued, `next` says how to
    ///  transmit it.
    Completed { completion: C, kind: ReceiptKind, next: Option<(Transmission, TimerRequest)> },
    /// The counter was corrected, the head must be retransmitted
    Corrected(Transmission, TimerRequest),
    Ignored(&'static str),
}

pub struct ReliableQueue<P, C> {
    stream: StreamType,
    base_timeout: Duration,
    max_timeout: Duration,
    capacity: usize,
    counter: SequenceCounter,
    queue: VecDeque<QueuedPacket<P, C>>,
    state: SendState,
    check_ids: CheckIds,
}

impl<P: AsRef<[u8]>, C> ReliableQueue<P, C> {
    /// Queue memory is reserved up front
    pub fn new(stream: StreamType, config: &ReliabilityConfig) -> ReliableQueue<P, C> {
        ReliableQueue {
            stream,
            base_timeout: config.retry_timeout,
            max_timeout: config.max_retry_timeout(),
            capacity: config.max_queued_packets,
            counter: SequenceCounter::new(config.initial_counter),
            queue: VecDeque::with_capacity(config.max_queued_packets),
            state: SendState::Idle,
            check_ids: CheckIds::default(),
        }
    }

    pub fn counter(&self) -> u16 {
        self.counter.get()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// the payload of the packet in flight
    pub fn head_payload(&self) -> Option<&P> {
        self.queue.front()
            .map(|p| &p.payload)
    }

    /// Queues a packet, returning it if the queue is full. If the packet is at the head of the
    ///  queue, the caller must transmit it right away.
    pub fn enqueue(&mut self, payload: P, timestamp: u64, completion: C) -> Result<Option<(Transmission, TimerRequest)>, (P, C)> {
        if self.is_full() {
            debug!("reliable queue for stream {:?} is full", self.stream);
            return Err((payload, completion));
        }

        self.queue.push_back(QueuedPacket { payload, timestamp, completion });

        match self.state {
            SendState::Idle => Ok(Some(self.transmit_head(self.base_timeout))),
            SendState::AwaitingReceipt { .. } => Ok(None),
        }
    }

    fn transmit_head(&mut self, timeout: Duration) -> (Transmission, TimerRequest) {
        let head = self.queue.front()
            .expect("this is a bug: transmitting from an empty queue");

        let check_id = self.check_ids.next();
        self.state = SendState::AwaitingReceipt { check_id, timeout };

        trace!("transmitting reliable packet on stream {:?} with counter {}", self.stream, self.counter.get());
        (
            Transmission {
                counter: self.counter.get(),
                timestamp: head.timestamp,
            },
            TimerRequest {
                check_id,
                delay: timeout,
            }
        )
    }

    pub fn on_receipt(&mut self, header: &PacketHeader, receipt: &Receipt) -> ReceiptOutcome<C> {
        let Some(head) = self.queue.front() else {
            return ReceiptOutcome::Ignored("no packet queued");
        };

        let kind = match receipt {
            Receipt::CounterCorrection { expected_counter, echoed } => {
                if echoed.timestamp != head.timestamp || echoed.counter != self.counter.get() {
                    return ReceiptOutcome::Ignored("stale counter correction");
                }
                if *expected_counter == self.counter.get() {
                    return ReceiptOutcome::Ignored("counter already corrected");
                }

                warn!("counter correction on stream {:?}: {} -> {}", self.stream, self.counter.get(), expected_counter);
                self.counter.set(*expected_counter);
                let (transmission, timer) = self.transmit_head(self.base_timeout);
                return ReceiptOutcome::Corrected(transmission, timer);
            }
            other => other.kind(),
        };

        if header.counter != self.counter.get() {
            return ReceiptOutcome::Ignored("receipt for a different counter");
        }

        if kind == ReceiptKind::Ok {
            self.counter.advance();
        }

        let completed = self.queue.pop_front()
            .expect("this is a bug: queue head vanished");

        let next = if self.queue.is_empty() {
            self.state = SendState::Idle;
            None
        }
        else {
            Some(self.transmit_head(self.base_timeout))
        };

        ReceiptOutcome::Completed {
            completion: completed.completion,
            kind,
            next,
        }
    }

    /// Removes all queued packets, returning their completion handles
    pub fn drain(&mut self) -> impl Iterator<Item = C> + '_ {
        self.state = SendState::Idle;
        self.queue.drain(..)
            .map(|p| p.completion)
    }
}

impl<P: AsRef<[u8]>, C> ReliableDelivery for ReliableQueue<P, C> {
    type Retry = Transmission;

    fn on_timer(&mut self, check_id: CheckId) -> Option<(Transmission, TimerRequest)> {
        match self.state {
            SendState::AwaitingReceipt { check_id: armed, timeout } if armed == check_id => {
                let backed_off = (timeout * 2).min(self.max_timeout);
                debug!("no receipt on stream {:?} after {:?} - retransmitting", self.stream, timeout);
                Some(self.transmit_head(backed_off))
            }
            _ => {
                trace!("stale retry timer on stream {:?}", self.stream);
                None
            }
        }
    }

    fn armed_timer(&self) -> Option<CheckId> {
        match self.state {
            SendState::Idle => None,
            SendState::AwaitingReceipt { check_id, .. } => Some(check_id),
        }
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.state = SendState::Idle;
    }
}
