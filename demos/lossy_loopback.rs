use std::time::Duration;

use anyhow::bail;
use bytes::BufMut;
use clap::Parser;
use clap_derive::Parser;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{self, Instant};
use tracing::{info, Level};

use telelink::blob::responder::BlobResponder;
use telelink::config::LinkConfig;
use telelink::error::HandlerError;
use telelink::events::{BlobEvent, LinkEvent, NoopObserver};
use telelink::link::ground::{GroundLink, GroundLinkHandle};
use telelink::link::onboard::OnboardLink;
use telelink::packet::header::{PacketHeader, StreamType};
use telelink::packet::receipt::ReceiptKind;
use telelink::stream::handler::{HandlerArray, HandlerMap, StreamHandler};
use telelink::test_util::*;

/// Runs a ground endpoint and a vehicle endpoint in one process, connected by an in-memory
///  channel that loses datagrams. The ground sends some commands and then downloads the
///  vehicle's firmware image.
#[derive(Parser)]
struct Args {
    /// probability of losing a datagram, in each direction
    #[clap(long, default_value_t = 0.2)]
    loss: f64,

    #[clap(long, default_value_t = 20_000)]
    blob_size: usize,

    #[clap(long, default_value_t = 10)]
    commands: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct CommandExecutor;

impl StreamHandler for CommandExecutor {
    fn handle(&mut self, header: &PacketHeader, payload: &[u8], response: &mut dyn BufMut) -> Result<(), HandlerError> {
        let command = std::str::from_utf8(payload)
            .map_err(|_| HandlerError::PayloadRejected("command is not UTF-8"))?;
        info!("vehicle: executing command #{} {:?}", header.counter, command);
        response.put_slice(b"ack");
        Ok(())
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if !(0.0..1.0).contains(&args.loss) {
        bail!("loss must be at least 0 and less than 1");
    }

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let (uplink_sink, mut uplink_source) = memory_channel(Loss::Random(args.loss));
    let (mut downlink_sink, downlink_source) = memory_channel(Loss::Random(args.loss));

    let ground = GroundLink::start(
        LinkConfig::ground(GROUND_ADDRESS, VEHICLE_ADDRESS),
        HandlerMap::new(),
        uplink_sink,
        downlink_source,
    )?;

    let firmware = test_blob(args.blob_size);
    let vehicle_config = LinkConfig::onboard(VEHICLE_ADDRESS, GROUND_ADDRESS);
    let mut responder: BlobResponder = BlobResponder::new(&firmware, "demo-vehicle", &vehicle_config.blob);
    let mut executor = CommandExecutor;
    let mut vehicle = OnboardLink::<_, 4096>::new(
        vehicle_config,
        HandlerArray::new()
            .with(StreamType::Cmd, &mut executor)
            .with(StreamType::Firmware, &mut responder),
        NoopObserver,
    )?;

    let result = select! {
        r = drive_onboard(&mut vehicle, &mut downlink_sink, &mut uplink_source, |_| false) => r,
        r = run_ground(&ground, args.commands) => r,
    };

    info!("ground link statistics: {:?}", ground.stats());
    info!("vehicle link statistics: {:?}", vehicle.stats());
    ground.shutdown().await;
    result
}

async fn run_ground(ground: &GroundLinkHandle, num_commands: usize) -> anyhow::Result<()> {
    let mut events = ground.subscribe();

    let started = Instant::now();
    for i in 0..num_commands {
        let response = ground.send_reliable(StreamType::Cmd, format!("set-waypoint {}", i)).await?;
        let response = response.await?;
        if response.kind != ReceiptKind::Ok {
            bail!("command {} failed: {:?}", i, response.kind);
        }
    }
    info!("ground: {} commands acknowledged after {:?}", num_commands, started.elapsed());

    let started = Instant::now();
    ground.start_blob_download().await?;
    let mut last_report = Instant::now();
    loop {
        match events.recv().await {
            Ok(LinkEvent::Blob(BlobEvent::SizeReceived { total, device_name })) => {
                info!("ground: downloading {} bytes from {}", total, device_name);
            }
            Ok(LinkEvent::Blob(BlobEvent::Progress { received, total })) => {
                if last_report.elapsed() > Duration::from_secs(1) {
                    info!("ground: {} of {} bytes", received, total);
                    last_report = Instant::now();
                }
            }
            Ok(LinkEvent::Blob(BlobEvent::Finished { size, .. })) => {
                info!("ground: downloaded {} bytes after {:?}", size, started.elapsed());
                break;
            }
            Ok(LinkEvent::Blob(BlobEvent::Failed(reason))) => bail!("download failed: {}", reason),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("ground link terminated"),
        }
    }

    // let the last receipts and pings drain before shutting down
    time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
