//! Side-channel notifications about what happens on a link. None of this is part of the
//!  protocol's correctness, it is for diagnostics and for applications following transfers.

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{FrameError, HandlerError};
use crate::packet::header::{PacketHeader, StreamType};
use crate::packet::receipt::ReceiptKind;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    /// bytes skipped while searching for the next frame
    Junk { len: usize },
    FrameRejected(FrameError),
    PacketReceived(PacketHeader),
    /// a decoded packet was not processed, e.g. because of its addresses or direction
    PacketDropped { header: PacketHeader, reason: &'static str },
    HandlerFailed { stream: StreamType, error: HandlerError },
    ReceiptSent { stream: StreamType, counter: u16, kind: ReceiptKind },
    CounterCorrected { stream: StreamType, counter: u16 },
    /// a reliable packet sent by the embedded endpoint was answered, `token` is the caller's
    ///  identification of the packet
    ReliableCompleted { stream: StreamType, token: u32, kind: ReceiptKind },
    Blob(BlobEvent),
}

/// Progress of a blob download
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlobEvent {
    Started,
    SizeReceived { total: u64, device_name: String },
    HashReceived,
    Progress { received: u64, total: u64 },
    Finished { size: u64, digest: Bytes, data: Bytes },
    Failed(String),
    /// the download was cancelled by the application
    Stopped,
    /// the blob's digest equals the previous download's, so it was not transferred again
    Skipped,
}

#[cfg_attr(test, automock)]
pub trait LinkObserver {
    fn on_event(&mut self, event: &LinkEvent);
}

/// Discards all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl LinkObserver for NoopObserver {
    fn on_event(&mut self, _event: &LinkEvent) {}
}

/// Fans events out to any number of subscribers
#[derive(Clone)]
pub struct LinkEventNotifier {
    sender: broadcast::Sender<LinkEvent>,
}

impl Default for LinkEventNotifier {
    fn default() -> Self {
        LinkEventNotifier::new()
    }
}

impl LinkEventNotifier {
    pub fn new() -> LinkEventNotifier {
        let (sender, _) = broadcast::channel(1024);

        LinkEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: LinkEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl LinkObserver for LinkEventNotifier {
    fn on_event(&mut self, event: &LinkEvent) {
        self.send_event(event.clone());
    }
}

/// Frame level counters
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct LinkStats {
    pub junk_bytes: u64,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub packets_dropped: u64,
}
