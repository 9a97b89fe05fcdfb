//! The ground endpoint, built from tokio tasks that communicate through channels:
//!
//! ```ascii
//!  ByteSource -> reader task --bytes--> link task --packets--> stream actors (one per stream)
//!                                                                    |
//!  ByteSink  <-- writer task <--------------frames-------------------+
//! ```
//!
//! Only the stream actors touch reliability state. The reader and writer tasks do nothing but
//!  transport I/O, and the link task owns the scanner.

use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::{EndpointRole, LinkConfig};
use crate::events::{LinkEvent, LinkEventNotifier, LinkStats};
use crate::link::scanner::{check_header, FrameScanner};
use crate::packet::frame::frame_len;
use crate::packet::header::StreamType;
use crate::stream::actor::{spawn_stream_actor, LinkClock, PacketResponse, StreamCommand, StreamContext};
use crate::stream::counters::StreamCounters;
use crate::stream::handler::HandlerMap;
use crate::transport::{ByteSink, ByteSource};

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug)]
enum LinkCommand {
    Shutdown(oneshot::Sender<()>),
}

pub struct GroundLink;

impl GroundLink {
    /// Spawns all of the endpoint's tasks on the current tokio runtime. Handlers registered for
    ///  a stream process reliable and unreliable packets the vehicle sends on it.
    pub fn start(config: LinkConfig, mut handlers: HandlerMap, sink: impl ByteSink + 'static, source: impl ByteSource + 'static) -> anyhow::Result<GroundLinkHandle> {
        config.validate()?;
        if config.role != EndpointRole::Ground {
            bail!("a ground link needs a ground configuration");
        }
        let scanner = FrameScanner::new(
            vec![0u8; config.receive_buffer_size],
            vec![0u8; frame_len(config.max_frame_size)],
            config.max_frame_size,
        )?;

        info!("starting ground link {} -> {}", config.self_address, config.peer_address);

        let config = Arc::new(config);
        let notifier = LinkEventNotifier::new();
        let (frames_send, frames_recv) = mpsc::channel(1024);
        let (bytes_send, bytes_recv) = mpsc::channel(64);
        let (link_send, link_recv) = mpsc::channel(16);
        let (stats_send, stats_recv) = watch::channel(LinkStats::default());

        let ctx = StreamContext {
            config: config.clone(),
            clock: LinkClock::new(),
            frames: frames_send,
            notifier: notifier.clone(),
        };

        let mut streams = Vec::with_capacity(StreamType::COUNT);
        let mut actor_handles = Vec::with_capacity(StreamType::COUNT);
        for stream in StreamType::ALL {
            let (commands, join_handle) = spawn_stream_actor(stream, ctx.clone(), handlers.take(stream));
            streams.push(commands);
            actor_handles.push(join_handle);
        }
        let streams: Arc<[mpsc::Sender<StreamCommand>]> = streams.into();

        tokio::spawn(run_writer(sink, frames_recv));
        let reader = tokio::spawn(run_reader(source, bytes_send));
        tokio::spawn(run_link(LinkTask {
            config,
            scanner,
            notifier: notifier.clone(),
            streams: streams.clone(),
            stats: stats_send,
            reader,
            actors: actor_handles,
        }, bytes_recv, link_recv));

        Ok(GroundLinkHandle {
            streams,
            link: link_send,
            notifier,
            stats: stats_recv,
        })
    }
}

/// The application's interface to a running ground endpoint
#[derive(Clone)]
pub struct GroundLinkHandle {
    streams: Arc<[mpsc::Sender<StreamCommand>]>,
    link: mpsc::Sender<LinkCommand>,
    notifier: LinkEventNotifier,
    stats: watch::Receiver<LinkStats>,
}

impl GroundLinkHandle {
    async fn send_command(&self, stream: StreamType, command: StreamCommand) -> anyhow::Result<()> {
        self.streams[stream.index()].send(command).await
            .map_err(|_| anyhow!("link is shut down"))
    }

    /// Queues a reliable packet. The returned receiver completes with the peer's receipt, or
    ///  with an error if the packet could not be sent or the link shuts down first.
    pub async fn send_reliable(&self, stream: StreamType, payload: impl Into<Vec<u8>>) -> anyhow::Result<oneshot::Receiver<PacketResponse>> {
        let (completion, response) = oneshot::channel();
        self.send_command(stream, StreamCommand::SendReliable { payload: payload.into(), completion }).await?;
        Ok(response)
    }

    pub async fn send_unreliable(&self, stream: StreamType, payload: impl Into<Vec<u8>>) -> anyhow::Result<()> {
        self.send_command(stream, StreamCommand::SendUnreliable(payload.into())).await
    }

    /// Progress is reported as [LinkEvent::Blob] events
    pub async fn start_blob_download(&self) -> anyhow::Result<()> {
        self.send_command(StreamType::Firmware, StreamCommand::StartBlobDownload).await
    }

    pub async fn stop_blob_download(&self) -> anyhow::Result<()> {
        self.send_command(StreamType::Firmware, StreamCommand::StopBlobDownload).await
    }

    pub async fn counters(&self, stream: StreamType) -> anyhow::Result<StreamCounters> {
        let (reply, counters) = oneshot::channel();
        self.send_command(stream, StreamCommand::QueryCounters(reply)).await?;
        Ok(counters.await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.notifier.subscribe()
    }

    pub fn stats(&self) -> LinkStats {
        *self.stats.borrow()
    }

    /// Stops all of the endpoint's tasks and waits for them to terminate. Pending completion
    ///  handles are dropped.
    pub async fn shutdown(&self) {
        let (ack_send, ack_recv) = oneshot::channel();
        if self.link.send(LinkCommand::Shutdown(ack_send)).await.is_err() {
            debug!("link is already shut down");
            return;
        }
        let _ = ack_recv.await;
    }
}

async fn run_writer(mut sink: impl ByteSink, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        trace!("writing {} bytes", frame.len());
        if let Err(e) = sink.send_bytes(&frame).await {
            error!("error writing to transport: {}", e);
        }
    }
    debug!("writer task terminated");
}

async fn run_reader(mut source: impl ByteSource, bytes: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match source.recv_bytes(&mut buf).await {
            Ok(0) => {
                info!("transport closed");
                break;
            }
            Ok(len) => {
                if bytes.send(buf[..len].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("error reading from transport: {}", e);
                break;
            }
        }
    }
    debug!("reader task terminated");
}

struct LinkTask {
    config: Arc<LinkConfig>,
    scanner: FrameScanner<Vec<u8>, Vec<u8>>,
    notifier: LinkEventNotifier,
    streams: Arc<[mpsc::Sender<StreamCommand>]>,
    stats: watch::Sender<LinkStats>,
    reader: JoinHandle<()>,
    actors: Vec<JoinHandle<()>>,
}

impl LinkTask {
    /// returns `true` if at least one packet was dispatched
    async fn on_bytes(&mut self, bytes: &[u8]) -> bool {
        self.scanner.accept_input(bytes);

        let mut dispatched = false;
        while let Some((header, payload)) = self.scanner.next_packet(&mut self.notifier) {
            if let Err(reason) = check_header(&self.config, &header) {
                warn!("received packet {:?} - dropping: {}", header, reason);
                self.scanner.count_dropped();
                self.notifier.send_event(LinkEvent::PacketDropped { header, reason });
                continue;
            }

            let command = StreamCommand::Received { header, payload: payload.to_vec() };
            if self.streams[header.stream.index()].send(command).await.is_err() {
                warn!("stream actor for {:?} terminated - dropping packet", header.stream);
            }
            dispatched = true;
        }

        self.stats.send_replace(self.scanner.stats());
        dispatched
    }

    async fn ping(&self) {
        trace!("peer was silent - sending ping");
        let _ = self.streams[StreamType::Cmd.index()].send(StreamCommand::SendUnreliable(Vec::new())).await;
    }

    async fn shutdown(self) {
        info!("shutting down ground link");
        self.reader.abort();
        for stream in self.streams.iter() {
            let _ = stream.send(StreamCommand::Shutdown).await;
        }
        for actor in self.actors {
            let _ = actor.await;
        }
    }
}

async fn run_link(mut task: LinkTask, mut bytes: mpsc::Receiver<Vec<u8>>, mut commands: mpsc::Receiver<LinkCommand>) {
    let mut ping_timer = time::interval(task.config.ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut received_since_ping = false;

    loop {
        select! {
            received = bytes.recv() => {
                match received {
                    Some(received) => {
                        if task.on_bytes(&received).await {
                            received_since_ping = true;
                        }
                    }
                    None => {
                        // the transport is closed, but the application may still want to shut down cleanly
                        debug!("reader task terminated - waiting for shutdown");
                        if let Some(LinkCommand::Shutdown(ack)) = commands.recv().await {
                            task.shutdown().await;
                            let _ = ack.send(());
                        }
                        return;
                    }
                }
            }
            _ = ping_timer.tick() => {
                if !received_since_ping {
                    task.ping().await;
                }
                received_since_ping = false;
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(LinkCommand::Shutdown(ack)) => {
                        task.shutdown().await;
                        let _ = ack.send(());
                    }
                    None => {
                        task.shutdown().await;
                    }
                }
                return;
            }
        }
    }
}
