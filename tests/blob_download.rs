use std::time::Duration;

use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time;
use tracing::Level;

use telelink::blob::responder::BlobResponder;
use telelink::config::LinkConfig;
use telelink::events::{BlobEvent, LinkEvent, NoopObserver};
use telelink::link::ground::GroundLink;
use telelink::link::onboard::OnboardLink;
use telelink::packet::header::StreamType;
use telelink::stream::handler::{HandlerArray, HandlerMap};
use telelink::test_util::*;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::INFO)
        .try_init()
        .ok();
}

const RX: usize = 4096;

/// waits for the next blob event that ends a download, skipping everything else
async fn download_result(events: &mut broadcast::Receiver<LinkEvent>) -> BlobEvent {
    loop {
        match events.recv().await {
            Ok(LinkEvent::Blob(event @ (BlobEvent::Finished { .. } | BlobEvent::Failed(_) | BlobEvent::Skipped | BlobEvent::Stopped))) => return event,
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => panic!("ground link terminated"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_blob_download_over_lossy_link() {
    let blob = test_blob(10_000);
    let (uplink_sink, mut uplink_source) = memory_channel(Loss::EveryNth(3));
    let (mut downlink_sink, downlink_source) = memory_channel(Loss::EveryNth(3));

    let ground = GroundLink::start(
        LinkConfig::ground(GROUND_ADDRESS, VEHICLE_ADDRESS),
        HandlerMap::new(),
        uplink_sink,
        downlink_source,
    ).unwrap();
    let mut events = ground.subscribe();

    let vehicle_config = LinkConfig::onboard(VEHICLE_ADDRESS, GROUND_ADDRESS);
    let mut responder: BlobResponder = BlobResponder::new(&blob, "uav-7", &vehicle_config.blob);
    let expected_digest = *responder.digest();
    let mut vehicle = OnboardLink::<_, RX>::new(
        vehicle_config,
        HandlerArray::new().with(StreamType::Firmware, &mut responder),
        NoopObserver,
    ).unwrap();

    ground.start_blob_download().await.unwrap();

    let vehicle_loop = drive_onboard(&mut vehicle, &mut downlink_sink, &mut uplink_source, |_| false);
    tokio::pin!(vehicle_loop);

    let result = select! {
        r = &mut vehicle_loop => panic!("vehicle terminated: {:?}", r),
        r = time::timeout(Duration::from_secs(600), download_result(&mut events)) => r.expect("blob download timed out"),
    };
    match result {
        BlobEvent::Finished { size, digest, data } => {
            assert_eq!(size, 10_000);
            assert_eq!(data.as_ref(), blob.as_slice());
            assert_eq!(digest.as_ref(), expected_digest.as_slice());
        }
        other => panic!("unexpected download result {:?}", other),
    }

    // the same blob again is recognized by its digest
    ground.start_blob_download().await.unwrap();
    let result = select! {
        r = &mut vehicle_loop => panic!("vehicle terminated: {:?}", r),
        r = time::timeout(Duration::from_secs(600), download_result(&mut events)) => r.expect("second download timed out"),
    };
    assert_eq!(result, BlobEvent::Skipped);

    ground.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_blob_download_can_be_stopped() {
    let blob = test_blob(50_000);
    let (uplink_sink, mut uplink_source) = memory_channel(Loss::None);
    let (mut downlink_sink, downlink_source) = memory_channel(Loss::None);

    let ground = GroundLink::start(
        LinkConfig::ground(GROUND_ADDRESS, VEHICLE_ADDRESS),
        HandlerMap::new(),
        uplink_sink,
        downlink_source,
    ).unwrap();
    let mut events = ground.subscribe();

    let vehicle_config = LinkConfig::onboard(VEHICLE_ADDRESS, GROUND_ADDRESS);
    let mut responder: BlobResponder = BlobResponder::new(&blob, "uav-7", &vehicle_config.blob);
    let mut vehicle = OnboardLink::<_, RX>::new(
        vehicle_config,
        HandlerArray::new().with(StreamType::Firmware, &mut responder),
        NoopObserver,
    ).unwrap();

    ground.start_blob_download().await.unwrap();

    let first_progress = async {
        loop {
            match events.recv().await {
                Ok(LinkEvent::Blob(BlobEvent::Progress { received, total })) => return (received, total),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("ground link terminated"),
            }
        }
    };

    let (received, total) = select! {
        r = drive_onboard(&mut vehicle, &mut downlink_sink, &mut uplink_source, |_| false) => panic!("vehicle terminated: {:?}", r),
        r = time::timeout(Duration::from_secs(60), first_progress) => r.expect("no download progress"),
    };
    assert!(received > 0);
    assert_eq!(total, 50_000);

    ground.stop_blob_download().await.unwrap();
    let result = time::timeout(Duration::from_secs(1), download_result(&mut events)).await
        .expect("stopping did not end the download");
    assert_eq!(result, BlobEvent::Stopped);

    ground.shutdown().await;
}
