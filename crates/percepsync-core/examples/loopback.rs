use bytes::Bytes;
use percepsync_core::{
    AudioChunk, CaptureConfig, CapturePeer, Clock, Config, Endpoint, Hub, ImageFrame,
    LifecycleState, PerceptionSubscriber, Registry, RendezvousServer, SensorPayload,
    SystemClock, TcpConnector,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Rendezvous server and hub in this process
    let registry = Arc::new(Registry::new());
    let server = RendezvousServer::bind("tcp://127.0.0.1:0", registry.clone()).await?;

    let mut config = Config::default();
    config.output.address = "tcp://127.0.0.1:0".into();
    config.heartbeat.port = 0;
    config.sync.fps = 10.0;

    let hub = Hub::new(config, registry.clone(), TcpConnector);
    let mut status = hub.status();
    let shutdown = CancellationToken::new();
    let hub_task = tokio::spawn(hub.run(server.events(), shutdown.clone()));

    // A capture peer feeding a 1x1 frame and 20 ms of silence every 20 ms
    let peer = Arc::new(
        CapturePeer::start(CaptureConfig {
            rendezvous: server.local_addr().to_string(),
            bind_host: "127.0.0.1".into(),
            ..CaptureConfig::default()
        })
        .await?,
    );
    let feeding = CancellationToken::new();
    let feeder = tokio::spawn({
        let peer = peer.clone();
        let feeding = feeding.clone();
        async move {
            let frame = SensorPayload::Image(ImageFrame {
                width: 1,
                height: 1,
                stride: 4,
                pixel_data: Bytes::from_static(&[0, 0, 0, 255]),
            });
            let silence = SensorPayload::Audio(AudioChunk::new(vec![0u8; 640]));
            let mut ticker = tokio::time::interval(Duration::from_millis(20));
            loop {
                tokio::select! {
                    _ = feeding.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = SystemClock.now();
                let _ = peer.publish("VideoEncodedImageCameraView", now, &frame);
                let _ = peer.publish("Audio", now, &silence);
            }
        }
    });

    tokio::time::timeout(TIMEOUT, status.wait_for(|state| *state == LifecycleState::Active))
        .await??;

    // Read a few perceptions from the advertised endpoint
    let address = registry
        .get("PercepSync")
        .and_then(|hub| match hub.find_stream("perception") {
            Some(Endpoint::PubSubSource { address, .. }) => Some(address.clone()),
            _ => None,
        })
        .ok_or_else(|| eyre::eyre!("the hub did not advertise its perceptions"))?;
    let mut subscriber = PerceptionSubscriber::connect(&address, Some("perception"), TIMEOUT).await?;

    for _ in 0..5 {
        let Some(envelope) = subscriber.next().await? else {
            break;
        };
        let perception = envelope.payload;
        println!(
            "t={:?} frame={}x{} audio={}B stale={}",
            perception.timestamp,
            perception.frame.width,
            perception.frame.height,
            perception.audio.len(),
            perception.stale
        );
    }

    feeding.cancel();
    feeder.await?;
    if let Some(peer) = Arc::into_inner(peer) {
        peer.stop().await;
    }
    shutdown.cancel();
    hub_task.await??;
    server.shutdown().await;

    Ok(())
}
