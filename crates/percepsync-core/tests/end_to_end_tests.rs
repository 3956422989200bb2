mod common;

use common::{AUDIO, TIMEOUT, VIDEO, audio, eventually, image, test_config};
use futures::StreamExt;
use percepsync_core::{
    CaptureConfig, CapturePeer, Clock, Endpoint, Hub, LifecycleState, Liveness,
    PerceptionSubscriber, Registry, RendezvousServer, SourceConnector, SystemClock, TcpConnector,
    source::InboundStream,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_capture_to_perception_over_tcp() {
    let registry = Arc::new(Registry::new());
    let server = RendezvousServer::bind("tcp://127.0.0.1:0", registry.clone())
        .await
        .unwrap();
    let rendezvous = format!("127.0.0.1:{}", server.local_addr().port());

    let config = test_config();
    let hub = Hub::new(config.clone(), registry.clone(), TcpConnector);
    let mut status = hub.status();
    let shutdown = CancellationToken::new();
    let hub_task = tokio::spawn(hub.run(server.events(), shutdown.clone()));

    let peer = CapturePeer::start(CaptureConfig {
        rendezvous,
        bind_host: "127.0.0.1".into(),
        heartbeat: config.heartbeat.clone(),
        connect_timeout: TIMEOUT,
        ..CaptureConfig::default()
    })
    .await
    .unwrap();
    assert!(peer.wait_for_readers(TIMEOUT).await);
    let peer = Arc::new(peer);

    let feeding = CancellationToken::new();
    let feeder = tokio::spawn({
        let feeding = feeding.clone();
        let peer = peer.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(20));
            let mut seq = 0u8;
            loop {
                tokio::select! {
                    _ = feeding.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = SystemClock.now();
                peer.publish(VIDEO, now, &image(seq)).unwrap();
                peer.publish(AUDIO, now, &audio(640)).unwrap();
                seq = seq.wrapping_add(1);
            }
        }
    });

    // The hub goes active and advertises its outputs.
    tokio::time::timeout(
        TIMEOUT,
        status.wait_for(|state| *state == LifecycleState::Active),
    )
    .await
    .unwrap()
    .unwrap();
    eventually(|| registry.contains("PercepSync")).await;
    let hub_process = registry.get("PercepSync").unwrap();
    let Some(Endpoint::PubSubSource { address, .. }) = hub_process.find_stream("perception")
    else {
        panic!("the hub does not advertise its perceptions");
    };

    let mut subscriber = PerceptionSubscriber::connect(address, Some("perception"), TIMEOUT)
        .await
        .unwrap();
    let perception = tokio::time::timeout(TIMEOUT, subscriber.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .payload;
    assert_eq!(perception.audio.len(), 640);
    assert!(!perception.stale);

    feeding.cancel();
    feeder.await.unwrap();
    let peer = Arc::into_inner(peer).unwrap();

    // The capture peer follows the hub's heartbeat.
    eventually(|| peer.hub().is_some() && peer.hub_liveness() == Liveness::Alive).await;

    // Leaving tears the session down and withdraws the hub.
    peer.stop().await;
    eventually(|| !registry.contains("PercepSync")).await;
    eventually(|| registry.is_empty()).await;
    eventually(|| *status.borrow() == LifecycleState::WaitingForPeer).await;

    shutdown.cancel();
    tokio::time::timeout(TIMEOUT, hub_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_capture_ignores_hub_of_another_version() {
    let registry = Arc::new(Registry::new());
    let server = RendezvousServer::bind("tcp://127.0.0.1:0", registry.clone())
        .await
        .unwrap();

    let peer = CapturePeer::start(CaptureConfig {
        rendezvous: format!("127.0.0.1:{}", server.local_addr().port()),
        bind_host: "127.0.0.1".into(),
        export_clock: false,
        connect_timeout: TIMEOUT,
        ..CaptureConfig::default()
    })
    .await
    .unwrap();
    assert!(registry.contains("PercepSyncHoloLensCapture"));
    assert!(
        peer.process()
            .endpoints
            .iter()
            .all(|endpoint| !matches!(endpoint, Endpoint::RemoteClockSource { .. }))
    );

    let hub = percepsync_core::Process::new(
        "PercepSync",
        vec![Endpoint::TcpSource {
            host: "127.0.0.1".into(),
            port: 1,
            stream: percepsync_core::StreamDescriptor::new("ServerHeartbeat", "percepsync.Heartbeat"),
        }],
    )
    .with_version("v0");
    registry.add(hub).unwrap();

    eventually(|| peer.client().mirror().contains("PercepSync")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer.hub().is_none());
    assert_eq!(peer.hub_liveness(), Liveness::Waiting);

    peer.stop().await;
    server.shutdown().await;
}

async fn open_stream(peer: &CapturePeer, name: &str) -> InboundStream {
    let endpoint = peer.process().find_stream(name).unwrap();
    let stream = endpoint.stream(name).unwrap();
    TcpConnector.open(endpoint, stream, TIMEOUT).await.unwrap()
}

#[tokio::test]
async fn test_capture_audio_burst_is_not_dropped() {
    let registry = Arc::new(Registry::new());
    let server = RendezvousServer::bind("tcp://127.0.0.1:0", registry.clone())
        .await
        .unwrap();
    let peer = CapturePeer::start(CaptureConfig {
        rendezvous: format!("127.0.0.1:{}", server.local_addr().port()),
        bind_host: "127.0.0.1".into(),
        export_clock: false,
        connect_timeout: TIMEOUT,
        ..CaptureConfig::default()
    })
    .await
    .unwrap();

    let _video = open_stream(&peer, VIDEO).await;
    let mut audio_stream = open_stream(&peer, AUDIO).await;
    assert!(peer.wait_for_readers(TIMEOUT).await);

    // Far more chunks than a lagging reader could buffer, sent at once.
    let burst = 500u64;
    for i in 0..burst {
        peer.publish(AUDIO, Duration::from_millis(i), &audio(640))
            .unwrap();
    }

    let received = tokio::time::timeout(TIMEOUT, async {
        let mut stamps = Vec::new();
        while stamps.len() < burst as usize {
            let message = audio_stream.next().await.unwrap().unwrap();
            stamps.push(message.timestamp);
        }
        stamps
    })
    .await
    .expect("audio chunks were lost");
    let expected: Vec<Duration> = (0..burst).map(Duration::from_millis).collect();
    assert_eq!(received, expected);

    peer.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_capture_with_a_taken_name_fails_to_start() {
    let registry = Arc::new(Registry::new());
    let server = RendezvousServer::bind("tcp://127.0.0.1:0", registry.clone())
        .await
        .unwrap();
    let config = CaptureConfig {
        rendezvous: format!("127.0.0.1:{}", server.local_addr().port()),
        bind_host: "127.0.0.1".into(),
        connect_timeout: TIMEOUT,
        ..CaptureConfig::default()
    };

    let first = CapturePeer::start(config.clone()).await.unwrap();
    let second = CapturePeer::start(config).await;

    assert!(second.is_err());
    assert_eq!(
        registry.get(&first.process().name).as_ref(),
        Some(first.process())
    );

    first.stop().await;
    server.shutdown().await;
}
