mod common;

use common::{
    AUDIO, ChannelConnector, Feed, TARGET, TIMEOUT, VIDEO, audio, capture_process, eventually,
    image, test_config,
};
use futures::{FutureExt, future::BoxFuture};
use percepsync_core::{
    AudioChunk, AudioFormat, Clock, Config, Hub, LifecycleState, Liveness, PerceptionSubscriber,
    Process, ProtocolError, Registry, RendezvousEvent, SessionError, SystemClock, TeardownReason,
    TimestampedMessage, Transcriber,
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pushes one video frame and 20 ms of audio every 20 ms, stamped with
/// the local clock, until cancelled.
fn start_feeding(video: Feed, audio_feed: Feed, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        let mut seq = 0u8;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = SystemClock.now();
            let _ = video.send(TimestampedMessage::new(now, image(seq)));
            let _ = audio_feed.send(TimestampedMessage::new(now, audio(640)));
            seq = seq.wrapping_add(1);
        }
    })
}

fn hub_with_feeds(config: Config) -> (Hub<ChannelConnector>, Arc<Registry>, Feed, Feed) {
    let mut connector = ChannelConnector::new();
    let video = connector.feed(VIDEO);
    let audio = connector.feed(AUDIO);
    let registry = Arc::new(Registry::new());
    let hub = Hub::new(config, registry.clone(), connector);
    (hub, registry, video, audio)
}

async fn subscribe(hub: &Hub<ChannelConnector>) -> PerceptionSubscriber {
    let port = hub.session().unwrap().publisher_addr().port();
    PerceptionSubscriber::connect(&format!("127.0.0.1:{port}"), Some("perception"), TIMEOUT)
        .await
        .unwrap()
}

async fn next_perception(subscriber: &mut PerceptionSubscriber) -> percepsync_core::Perception {
    tokio::time::timeout(TIMEOUT, subscriber.next())
        .await
        .expect("no perception in time")
        .unwrap()
        .expect("publisher hung up")
        .payload
}

#[tokio::test]
async fn test_version_mismatch_keeps_waiting() {
    let (mut hub, _registry, _video, _audio) = hub_with_feeds(test_config());

    let result = hub
        .handle(RendezvousEvent::ProcessAdded(capture_process(Some("v2"))))
        .await;

    assert!(matches!(result, Err(SessionError::VersionMismatch { .. })));
    assert!(hub.session().is_none());
    assert_eq!(hub.state(), LifecycleState::WaitingForPeer);
}

#[tokio::test]
async fn test_missing_stream_fails_construction() {
    let (mut hub, _registry, _video, _audio) = hub_with_feeds(test_config());
    let mut process = capture_process(Some("v1"));
    process.endpoints.pop();

    let result = hub.handle(RendezvousEvent::ProcessAdded(process)).await;

    assert!(matches!(result, Err(SessionError::MissingStream { .. })));
    assert_eq!(hub.state(), LifecycleState::WaitingForPeer);
}

#[tokio::test]
async fn test_unrelated_process_is_ignored() {
    let (mut hub, _registry, _video, _audio) = hub_with_feeds(test_config());
    let other = Process::new("Webcam", vec![]);

    hub.handle(RendezvousEvent::ProcessAdded(other.clone()))
        .await
        .unwrap();
    hub.handle(RendezvousEvent::ProcessRemoved(other))
        .await
        .unwrap();

    assert!(hub.session().is_none());
    assert_eq!(hub.lifecycle().teardowns(), 0);
}

#[tokio::test]
async fn test_session_publishes_and_tears_down() {
    let (mut hub, registry, video, audio_feed) = hub_with_feeds(test_config());
    let cancel = CancellationToken::new();
    let feeder = start_feeding(video, audio_feed, cancel.clone());

    hub.handle(RendezvousEvent::ProcessAdded(capture_process(Some("v1"))))
        .await
        .unwrap();
    assert_eq!(hub.state(), LifecycleState::Connecting);
    assert!(!registry.contains("PercepSync"));

    let mut subscriber = subscribe(&hub).await;
    let first = next_perception(&mut subscriber).await;
    assert_eq!(first.audio.len(), 640);
    assert_eq!(first.frame.width, 2);
    assert!(first.transcript.is_empty());

    let second = next_perception(&mut subscriber).await;
    assert!(second.timestamp > first.timestamp);

    // Data arrivals make the peer alive, which activates the session
    // and advertises the hub.
    assert_eq!(hub.check_liveness(), Some(Liveness::Alive));
    assert_eq!(hub.state(), LifecycleState::Active);
    let advertised = registry.get("PercepSync").unwrap();
    assert_eq!(&advertised, hub.session().unwrap().hub_process());
    assert!(advertised.find_stream("ServerHeartbeat").is_some());
    assert!(advertised.find_stream("perception").is_some());

    hub.handle(RendezvousEvent::ProcessRemoved(capture_process(Some("v1"))))
        .await
        .unwrap();
    assert_eq!(hub.state(), LifecycleState::WaitingForPeer);
    assert_eq!(
        hub.lifecycle().last_teardown(),
        Some(TeardownReason::ProcessRemoved)
    );
    assert!(hub.session().is_none());
    assert!(!registry.contains("PercepSync"));

    // The publisher is gone with the session.
    let end = tokio::time::timeout(TIMEOUT, async {
        loop {
            match subscriber.next().await {
                Ok(Some(_)) => continue,
                other => break other,
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(end, Ok(None) | Err(_)));

    // A repeated removal is harmless.
    hub.handle(RendezvousEvent::ProcessRemoved(capture_process(Some("v1"))))
        .await
        .unwrap();
    assert_eq!(hub.lifecycle().teardowns(), 1);

    cancel.cancel();
    feeder.await.unwrap();
}

#[tokio::test]
async fn test_session_is_rebuilt_after_reannouncement() {
    let (mut hub, _registry, video, audio_feed) = hub_with_feeds(test_config());
    let cancel = CancellationToken::new();
    let feeder = start_feeding(video, audio_feed, cancel.clone());

    for round in 0..2 {
        hub.handle(RendezvousEvent::ProcessAdded(capture_process(Some("v1"))))
            .await
            .unwrap();
        let mut subscriber = subscribe(&hub).await;
        next_perception(&mut subscriber).await;

        hub.handle(RendezvousEvent::ProcessRemoved(capture_process(Some("v1"))))
            .await
            .unwrap();
        assert_eq!(hub.lifecycle().teardowns(), round + 1);
    }

    cancel.cancel();
    feeder.await.unwrap();
}

/// A port nothing listens on right now.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_session_is_rebuilt_on_fixed_ports() {
    let mut config = test_config();
    let output_port = free_port();
    config.output.address = format!("tcp://127.0.0.1:{output_port}");
    config.heartbeat.port = free_port();
    let heartbeat_port = config.heartbeat.port;
    let (mut hub, _registry, video, audio_feed) = hub_with_feeds(config);
    let cancel = CancellationToken::new();
    let feeder = start_feeding(video, audio_feed, cancel.clone());

    for round in 0..3 {
        hub.handle(RendezvousEvent::ProcessAdded(capture_process(Some("v1"))))
            .await
            .unwrap_or_else(|err| panic!("round {round} failed to rebuild: {err}"));
        let session = hub.session().unwrap();
        assert_eq!(session.publisher_addr().port(), output_port);
        assert_eq!(session.heartbeat_addr().port(), heartbeat_port);

        // Leave a reader connected so teardown has live connections to close.
        let mut subscriber = subscribe(&hub).await;
        next_perception(&mut subscriber).await;

        hub.handle(RendezvousEvent::ProcessRemoved(capture_process(Some("v1"))))
            .await
            .unwrap();
        assert!(hub.session().is_none());
    }
    assert_eq!(hub.lifecycle().teardowns(), 3);

    cancel.cancel();
    feeder.await.unwrap();
}

#[tokio::test]
async fn test_teardown_keeps_the_peer_entry() {
    let (mut hub, registry, video, audio_feed) = hub_with_feeds(test_config());
    let cancel = CancellationToken::new();
    let feeder = start_feeding(video, audio_feed, cancel.clone());
    let process = capture_process(Some("v1"));
    registry.add(process.clone()).unwrap();

    hub.handle(RendezvousEvent::ProcessAdded(process.clone()))
        .await
        .unwrap();
    let mut subscriber = subscribe(&hub).await;
    next_perception(&mut subscriber).await;
    assert_eq!(hub.check_liveness(), Some(Liveness::Alive));
    assert!(registry.contains("PercepSync"));

    hub.tear_down(TeardownReason::Shutdown).await;

    assert!(!registry.contains("PercepSync"));
    assert_eq!(registry.get(TARGET), Some(process));

    cancel.cancel();
    feeder.await.unwrap();
}

#[tokio::test]
async fn test_silent_peer_degrades_and_recovers() {
    let mut config = test_config();
    config.heartbeat.period = Duration::from_millis(20);
    config.heartbeat.timeout_multiple = 5;
    let (mut hub, _registry, video, audio_feed) = hub_with_feeds(config);

    hub.handle(RendezvousEvent::ProcessAdded(capture_process(Some("v1"))))
        .await
        .unwrap();
    let mut subscriber = subscribe(&hub).await;

    let cancel = CancellationToken::new();
    let feeder = start_feeding(video.clone(), audio_feed.clone(), cancel.clone());
    next_perception(&mut subscriber).await;
    assert_eq!(hub.check_liveness(), Some(Liveness::Alive));
    assert_eq!(hub.state(), LifecycleState::Active);

    cancel.cancel();
    feeder.await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.check_liveness(), Some(Liveness::Stale));
    assert_eq!(hub.state(), LifecycleState::Degraded);

    // Output resumes flagged as stale until liveness is sampled again.
    let cancel = CancellationToken::new();
    let feeder = start_feeding(video, audio_feed, cancel.clone());
    loop {
        if next_perception(&mut subscriber).await.stale {
            break;
        }
    }

    assert_eq!(hub.check_liveness(), Some(Liveness::Alive));
    assert_eq!(hub.state(), LifecycleState::Active);
    loop {
        if !next_perception(&mut subscriber).await.stale {
            break;
        }
    }

    hub.tear_down(TeardownReason::Shutdown).await;
    cancel.cancel();
    feeder.await.unwrap();
}

#[tokio::test]
async fn test_fatal_rendezvous_error_tears_down() {
    let (mut hub, _registry, _video, _audio) = hub_with_feeds(test_config());
    hub.handle(RendezvousEvent::ProcessAdded(capture_process(Some("v1"))))
        .await
        .unwrap();

    hub.handle(RendezvousEvent::error(ProtocolError::UnknownEndpointKind))
        .await
        .unwrap();
    assert!(hub.session().is_some());

    hub.handle(RendezvousEvent::error(ProtocolError::ConnectionLost))
        .await
        .unwrap();
    assert!(hub.session().is_none());
    assert_eq!(
        hub.lifecycle().last_teardown(),
        Some(TeardownReason::ProtocolError)
    );
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let (hub, registry, video, audio_feed) = hub_with_feeds(test_config());
    let cancel = CancellationToken::new();
    let feeder = start_feeding(video, audio_feed, cancel.clone());

    let (events_tx, events) = flume::unbounded();
    let shutdown = CancellationToken::new();
    let mut status = hub.status();
    let running = tokio::spawn(hub.run(events, shutdown.clone()));

    events_tx
        .send(RendezvousEvent::ProcessAdded(capture_process(Some("v1"))))
        .unwrap();
    tokio::time::timeout(
        TIMEOUT,
        status.wait_for(|state| *state == LifecycleState::Active),
    )
    .await
    .unwrap()
    .unwrap();
    eventually(|| registry.contains("PercepSync")).await;

    shutdown.cancel();
    tokio::time::timeout(TIMEOUT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(*status.borrow(), LifecycleState::WaitingForPeer);
    assert!(!registry.contains("PercepSync"));

    cancel.cancel();
    feeder.await.unwrap();
}

/// Recognizes every non-silent frame as the same word.
struct Echo;

impl Transcriber for Echo {
    fn transcribe(
        &self,
        audio: AudioChunk,
        _format: AudioFormat,
    ) -> BoxFuture<'static, eyre::Result<Option<String>>> {
        let text = (!audio.is_empty()).then(|| "hello".to_string());
        futures::future::ready(Ok(text)).boxed()
    }
}

#[tokio::test]
async fn test_transcripts_reach_perceptions() {
    // Transcripts share the audio frame timestamps, so any window of at
    // least one interval catches them regardless of timer phase.
    let mut config = test_config();
    config.sync.transcript_window = Some(Duration::from_millis(40));
    let (hub, _registry, video, audio_feed) = hub_with_feeds(config);
    let mut hub = hub.with_transcriber(Arc::new(Echo));
    let cancel = CancellationToken::new();
    let feeder = start_feeding(video, audio_feed, cancel.clone());

    hub.handle(RendezvousEvent::ProcessAdded(capture_process(Some("v1"))))
        .await
        .unwrap();
    let mut subscriber = subscribe(&hub).await;

    let found = tokio::time::timeout(TIMEOUT, async {
        loop {
            let perception = next_perception(&mut subscriber).await;
            if !perception.transcript.is_empty() {
                break perception.transcript;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(found, "hello");
    assert_eq!(hub.session().unwrap().process().name, TARGET);

    hub.tear_down(TeardownReason::Shutdown).await;
    cancel.cancel();
    feeder.await.unwrap();
}

#[tokio::test]
async fn test_peer_clock_offset_is_applied_or_skipped() {
    let clock_endpoint = percepsync_core::Endpoint::RemoteClockSource {
        host: "127.0.0.1".into(),
        port: 20003,
    };
    let mut process = capture_process(Some("v1"));
    process.endpoints.push(clock_endpoint);

    // A readable peer clock shifts the session clock.
    let offset = chrono::TimeDelta::milliseconds(250);
    let mut connector = ChannelConnector::new().with_clock_offset(offset);
    let _video = connector.feed(VIDEO);
    let _audio = connector.feed(AUDIO);
    let mut hub = Hub::new(test_config(), Arc::new(Registry::new()), connector);

    hub.handle(RendezvousEvent::ProcessAdded(process.clone()))
        .await
        .unwrap();
    assert_eq!(hub.session().unwrap().clock_offset(), offset);
    hub.tear_down(TeardownReason::Shutdown).await;

    // An unreadable one falls back to the local clock.
    let (mut hub, _registry, _video, _audio) = hub_with_feeds(test_config());
    hub.handle(RendezvousEvent::ProcessAdded(process))
        .await
        .unwrap();
    assert_eq!(
        hub.session().unwrap().clock_offset(),
        chrono::TimeDelta::zero()
    );
    hub.tear_down(TeardownReason::Shutdown).await;
}
