//! Ground side driver for one stream. Each stream's state is owned by its own tokio task and is
//!  only touched in response to commands, timers included: a timer is a spawned task that sleeps
//!  and then sends a command tagged with its check id back to the actor.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::blob::messages::BlobRequest;
use crate::blob::requester::BlobRequester;
use crate::config::LinkConfig;
use crate::events::{LinkEvent, LinkEventNotifier};
use crate::packet::frame;
use crate::packet::header::{PacketHeader, PacketKind, StreamType};
use crate::packet::receipt::{Receipt, ReceiptKind};
use crate::stream::counters::{SequenceCounter, StreamCounters};
use crate::stream::delivery::{CheckId, ReliableDelivery, TimerRequest};
use crate::stream::handler::{BoxedStreamHandler, StreamHandler};
use crate::stream::inbound::{receipt_room, InboundStream};
use crate::stream::reliable_queue::{ReceiptOutcome, ReliableQueue, Transmission};

/// The answer to a reliable packet, delivered through its completion handle
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PacketResponse {
    pub kind: ReceiptKind,
    /// the handler output the receipt carried
    pub payload: Vec<u8>,
    pub counter: u16,
    /// the receipt's timestamp in the peer's time
    pub timestamp: u64,
}

#[derive(Debug)]
pub enum StreamCommand {
    SendReliable { payload: Vec<u8>, completion: oneshot::Sender<PacketResponse> },
    SendUnreliable(Vec<u8>),
    Received { header: PacketHeader, payload: Vec<u8> },
    RetryTimer(CheckId),
    BlobTimer(CheckId),
    StartBlobDownload,
    StopBlobDownload,
    QueryCounters(oneshot::Sender<StreamCounters>),
    Shutdown,
}

/// Milliseconds since the link was started, used as packet timestamps
#[derive(Debug, Clone, Copy)]
pub struct LinkClock {
    start: Instant,
}

impl LinkClock {
    pub fn new() -> LinkClock {
        LinkClock {
            start: Instant::now(),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

impl Default for LinkClock {
    fn default() -> Self {
        LinkClock::new()
    }
}

/// What all stream actors of a link share
#[derive(Clone)]
pub struct StreamContext {
    pub config: Arc<LinkConfig>,
    pub clock: LinkClock,
    /// encoded frames for the writer task
    pub frames: mpsc::Sender<Vec<u8>>,
    pub notifier: LinkEventNotifier,
}

impl StreamContext {
    async fn send_frame(&self, header: &PacketHeader, payload: &[u8]) {
        let mut buf = Vec::with_capacity(frame::frame_len(self.config.max_frame_size));
        if let Err(e) = frame::encode_with_payload(&mut buf, header, self.config.max_frame_size, payload) {
            warn!("cannot send packet on stream {:?}: {}", header.stream, e);
            return;
        }

        trace!("sending {:?} packet on stream {:?} with counter {}", header.kind, header.stream, header.counter);
        if self.frames.send(buf).await.is_err() {
            debug!("writer task terminated - dropping frame");
        }
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
}

pub struct StreamActor {
    stream: StreamType,
    ctx: StreamContext,
    commands: mpsc::WeakSender<StreamCommand>,
    handler: Option<BoxedStreamHandler>,
    queue: ReliableQueue<Vec<u8>, oneshot::Sender<PacketResponse>>,
    inbound: InboundStream<Vec<u8>>,
    unreliable_out: SequenceCounter,
    blob: Option<BlobRequester<LinkEventNotifier>>,
    retry_timer: Option<JoinHandle<()>>,
    blob_timer: Option<JoinHandle<()>>,
}

/// Spawns the actor for a stream, returning the sender for its commands. The actor terminates
///  on `Shutdown` or when all senders are dropped.
pub fn spawn_stream_actor(stream: StreamType, ctx: StreamContext, handler: Option<BoxedStreamHandler>) -> (mpsc::Sender<StreamCommand>, JoinHandle<()>) {
    let (send, recv) = mpsc::channel(1024);
    let actor = StreamActor::new(stream, ctx, handler, send.downgrade());
    let join_handle = tokio::spawn(run_stream_actor(actor, recv));
    (send, join_handle)
}

pub async fn run_stream_actor(mut actor: StreamActor, mut commands: mpsc::Receiver<StreamCommand>) {
    while let Some(command) = commands.recv().await {
        if matches!(command, StreamCommand::Shutdown) {
            break;
        }
        actor.on_command(command).await;
    }
    actor.shutdown();
}

impl StreamActor {
    pub fn new(stream: StreamType, ctx: StreamContext, handler: Option<BoxedStreamHandler>, commands: mpsc::WeakSender<StreamCommand>) -> StreamActor {
        let reliability = &ctx.config.reliability;

        let blob = (stream == StreamType::Firmware)
            .then(|| BlobRequester::new(ctx.config.blob.clone(), ctx.notifier.clone()));

        StreamActor {
            stream,
            queue: ReliableQueue::new(stream, reliability),
            inbound: InboundStream::new(stream, reliability.initial_counter, Vec::new()),
            unreliable_out: SequenceCounter::new(reliability.initial_counter),
            blob,
            handler,
            commands,
            retry_timer: None,
            blob_timer: None,
            ctx,
        }
    }

    pub async fn on_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::SendReliable { payload, completion } => self.send_reliable(payload, completion).await,
            StreamCommand::SendUnreliable(payload) => self.send_unreliable(&payload).await,
            StreamCommand::Received { header, payload } => self.on_received(header, &payload).await,
            StreamCommand::RetryTimer(check_id) => {
                if let Some((transmission, timer)) = self.queue.on_timer(check_id) {
                    self.transmit_head(transmission, timer).await;
                }
            }
            StreamCommand::BlobTimer(check_id) => {
                if let Some(retry) = self.blob.as_mut().and_then(|b| b.on_timer(check_id)) {
                    self.send_blob_request(retry).await;
                }
            }
            StreamCommand::StartBlobDownload => {
                let Some(blob) = self.blob.as_mut() else {
                    warn!("no blob download on stream {:?}", self.stream);
                    return;
                };
                if let Some(start) = blob.start() {
                    self.send_blob_request(start).await;
                }
            }
            StreamCommand::StopBlobDownload => {
                if let Some(stop) = self.blob.as_mut().and_then(|b| b.stop()) {
                    abort(&mut self.blob_timer);
                    self.send_request(stop).await;
                }
            }
            StreamCommand::QueryCounters(reply) => {
                let _ = reply.send(self.counters());
            }
            StreamCommand::Shutdown => {
                self.shutdown();
            }
        }
    }

    pub fn counters(&self) -> StreamCounters {
        StreamCounters {
            reliable_out: self.queue.counter(),
            unreliable_out: self.unreliable_out.get(),
            expected_reliable_in: self.inbound.expected_reliable(),
            expected_unreliable_in: self.inbound.expected_unreliable(),
        }
    }

    async fn send_reliable(&mut self, payload: Vec<u8>, completion: oneshot::Sender<PacketResponse>) {
        let widest_header = self.ctx.header(self.stream, PacketKind::Reliable, 0, u64::MAX);
        if 2 + widest_header.serialized_len() + payload.len() > self.ctx.config.max_frame_size {
            warn!("reliable payload of {} bytes does not fit into a frame on stream {:?} - dropping", payload.len(), self.stream);
            return;
        }

        match self.queue.enqueue(payload, self.ctx.clock.now_millis(), completion) {
            Ok(Some((transmission, timer))) => self.transmit_head(transmission, timer).await,
            Ok(None) => trace!("queued reliable packet on stream {:?} behind {} others", self.stream, self.queue.len() - 1),
            Err(_) => warn!("reliable queue of stream {:?} is full - dropping packet", self.stream),
        }
    }

    async fn send_unreliable(&mut self, payload: &[u8]) {
        let header = self.ctx.header(self.stream, PacketKind::Unreliable, self.unreliable_out.next(), self.ctx.clock.now_millis());
        self.ctx.send_frame(&header, payload).await;
    }

    async fn transmit_head(&mut self, transmission: Transmission, timer: TimerRequest) {
        let header = self.ctx.header(self.stream, PacketKind::Reliable, transmission.counter, transmission.timestamp);
        let payload = self.queue.head_payload()
            .expect("this is a bug: transmitting the head of an empty queue");
        self.ctx.send_frame(&header, payload).await;

        let timer = self.spawn_timer(timer, StreamCommand::RetryTimer);
        replace_timer(&mut self.retry_timer, timer);
    }

    async fn send_blob_request(&mut self, (request, timer): (BlobRequest, TimerRequest)) {
        self.send_request(request).await;
        let timer = self.spawn_timer(timer, StreamCommand::BlobTimer);
        replace_timer(&mut self.blob_timer, timer);
    }

    async fn send_request(&mut self, request: BlobRequest) {
        let mut payload = Vec::new();
        request.ser(&mut payload);
        self.send_unreliable(&payload).await;
    }

    fn spawn_timer(&self, timer: TimerRequest, command: fn(CheckId) -> StreamCommand) -> JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            time::sleep(timer.delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(command(timer.check_id)).await;
            }
        })
    }

    async fn on_received(&mut self, header: PacketHeader, payload: &[u8]) {
        match header.kind {
            PacketKind::Receipt => self.on_receipt(&header, payload).await,
            PacketKind::Reliable => self.on_reliable(&header, payload).await,
            PacketKind::Unreliable => self.on_unreliable(&header, payload).await,
        }
    }

    async fn on_receipt(&mut self, header: &PacketHeader, payload: &[u8]) {
        let receipt = match Receipt::try_deser(payload) {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("received invalid receipt on stream {:?} - dropping: {}", self.stream, e);
                self.ctx.notifier.send_event(LinkEvent::PacketDropped { header: *header, reason: "invalid receipt" });
                return;
            }
        };

        match self.queue.on_receipt(header, &receipt) {
            ReceiptOutcome::Completed { completion, kind, next } => {
                debug!("reliable packet {} on stream {:?} completed with {:?}", header.counter, self.stream, kind);
                let _ = completion.send(PacketResponse {
                    kind,
                    payload: receipt.data().to_vec(),
                    counter: header.counter,
                    timestamp: header.timestamp,
                });
                match next {
                    Some((transmission, timer)) => self.transmit_head(transmission, timer).await,
                    None => abort(&mut self.retry_timer),
                }
            }
            ReceiptOutcome::Corrected(transmission, timer) => {
                self.ctx.notifier.send_event(LinkEvent::CounterCorrected { stream: self.stream, counter: transmission.counter });
                self.transmit_head(transmission, timer).await;
            }
            ReceiptOutcome::Ignored(reason) => {
                debug!("received receipt {} on stream {:?} - ignoring: {}", header.counter, self.stream, reason);
            }
        }
    }

    async fn on_reliable(&mut self, header: &PacketHeader, payload: &[u8]) {
        let room = receipt_room(self.ctx.config.max_frame_size, header);
        let handler = self.handler.as_deref_mut()
            .map(|h| h as &mut dyn StreamHandler);
        let answer = self.inbound.on_reliable(header, payload, handler, room);

        let kind = answer.kind();
        let mut receipt = Vec::new();
        answer.ser(&mut receipt);

        let receipt_header = header.receipt_header(self.ctx.clock.now_millis());
        self.ctx.send_frame(&receipt_header, &receipt).await;
        self.ctx.notifier.send_event(LinkEvent::ReceiptSent { stream: self.stream, counter: header.counter, kind });
    }

    async fn on_unreliable(&mut self, header: &PacketHeader, payload: &[u8]) {
        if self.blob.is_some() {
            self.inbound.track_unreliable(header);
            match self.blob.as_mut().and_then(|b| b.on_response(payload)) {
                Some(next) => self.send_blob_request(next).await,
                None => if !self.blob.as_ref().is_some_and(|b| b.is_active()) {
                    abort(&mut self.blob_timer);
                },
            }
            return;
        }

        let handler = self.handler.as_deref_mut()
            .map(|h| h as &mut dyn StreamHandler);
        if let Err(error) = self.inbound.on_unreliable(header, payload, handler) {
            self.ctx.notifier.send_event(LinkEvent::HandlerFailed { stream: self.stream, error });
        }
    }

    /// Cancels timers and pending work. Dropping the completion handles notifies waiting callers.
    pub fn shutdown(&mut self) {
        debug!("shutting down stream {:?}", self.stream);
        abort(&mut self.retry_timer);
        abort(&mut self.blob_timer);
        self.queue.drain().for_each(drop);
        if let Some(blob) = self.blob.as_mut() {
            blob.reset();
        }
    }
}

fn replace_timer(slot: &mut Option<JoinHandle<()>>, timer: JoinHandle<()>) {
    abort(slot);
    *slot = Some(timer);
}

fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}
