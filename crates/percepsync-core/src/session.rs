//! One synchronization session against one capture process.

use crate::{
    clock::{OffsetClock, SystemClock},
    config::{Config, TargetConfig},
    edge::{Delivery, Discard, EdgeSender, edge},
    endpoint::{Endpoint, EndpointKind, StreamDescriptor},
    heartbeat::{HeartbeatBeacon, HeartbeatMonitor, Liveness},
    publisher::FanoutPublisher,
    reframe::Reframer,
    registry::{Process, Registry},
    source::{InboundStream, SourceConnector},
    speech::{Transcriber, TranscriptWorker},
    state::SyncStats,
    sync::{SyncInputs, sync},
    types::{
        AudioChunk, ImageFrame, Perception, PerceptionStream, SensorPayload, TimestampedMessage,
    },
    wire::ProtocolError,
};
use chrono::TimeDelta;
use futures::StreamExt;
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Type tag of the hub's heartbeat stream.
pub const HEARTBEAT_TYPE: &str = "percepsync.Heartbeat";
/// Type tag of the published perception stream.
pub const PERCEPTION_TYPE: &str = "percepsync.Perception";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("process {process} announced version {actual:?}, expected {expected}")]
    VersionMismatch {
        process: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("process {process} does not expose stream {stream}")]
    MissingStream { process: String, stream: String },

    #[error("unable to open stream {stream}: {source}")]
    Connect {
        stream: String,
        #[source]
        source: ProtocolError,
    },

    #[error("unable to start the perception publisher: {0}")]
    Publisher(#[source] ProtocolError),

    #[error("unable to start the heartbeat beacon: {0}")]
    Heartbeat(#[source] ProtocolError),

    #[error("invalid synchronizer setup: {0}")]
    Setup(String),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::Connect {
                source: ProtocolError::ConnectTimeout { .. },
                ..
            }
        )
    }
}

/// Fails unless `process` announces the version the target requires.
pub fn check_version(target: &TargetConfig, process: &Process) -> Result<(), SessionError> {
    match &target.version {
        Some(expected) if process.version.as_deref() != Some(expected.as_str()) => {
            Err(SessionError::VersionMismatch {
                process: process.name.clone(),
                expected: expected.clone(),
                actual: process.version.clone(),
            })
        }
        _ => Ok(()),
    }
}

fn find_stream<'a>(
    process: &'a Process,
    name: &str,
) -> Result<(&'a Endpoint, &'a StreamDescriptor), SessionError> {
    process
        .endpoints
        .iter()
        .find_map(|endpoint| Some((endpoint, endpoint.stream(name)?)))
        .ok_or_else(|| SessionError::MissingStream {
            process: process.name.clone(),
            stream: name.to_string(),
        })
}

/// A running session: input connections, the synchronizer, the
/// perception publisher and the heartbeat beacon.
///
/// The session is owned by the hub and destroyed by [teardown](Self::teardown).
pub struct Session {
    process: Process,
    hub_process: Process,
    advertised: bool,
    publisher: Arc<FanoutPublisher<Perception>>,
    beacon: HeartbeatBeacon,
    monitor: Arc<HeartbeatMonitor>,
    stale: Arc<AtomicBool>,
    stats: watch::Receiver<SyncStats>,
    rates: watch::Sender<(f32, f32)>,
    last_sample: (Instant, SyncStats),
    clock_offset: TimeDelta,
    pacing_cancel: CancellationToken,
    pacing_task: JoinHandle<()>,
    io_cancel: CancellationToken,
    io_tasks: Vec<JoinHandle<()>>,
    worker: Option<TranscriptWorker>,
    edges: Vec<Box<dyn Discard>>,
    _guards: [DropGuard; 2],
}

impl Session {
    /// Wires a session for `process`.
    ///
    /// Every fallible step runs before any task is spawned, so nothing
    /// is left running when construction fails.
    pub async fn start<C>(
        process: Process,
        config: &Config,
        connector: &C,
        transcriber: Option<Arc<dyn Transcriber>>,
    ) -> Result<Self, SessionError>
    where
        C: SourceConnector + ?Sized,
    {
        check_version(&config.target, &process)?;
        let (video_endpoint, video_stream) = find_stream(&process, &config.target.video_stream)?;
        let (audio_endpoint, audio_stream) = find_stream(&process, &config.target.audio_stream)?;
        let timeout = config.connect_timeout;
        let setup = |err: eyre::Report| SessionError::Setup(format!("{err:#}"));

        let clock_offset = match process
            .endpoints
            .iter()
            .find(|endpoint| endpoint.kind() == EndpointKind::RemoteClockSource)
        {
            Some(endpoint) => match connector.clock_offset(endpoint, timeout).await {
                Ok(offset) => {
                    info!(endpoint = %endpoint, offset_ms = offset.num_milliseconds(), "Using the peer clock");
                    offset
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "Peer clock unavailable, using the local clock");
                    TimeDelta::zero()
                }
            },
            None => TimeDelta::zero(),
        };
        let clock = OffsetClock::new(SystemClock, clock_offset);

        let reframer =
            Reframer::for_interval(config.sync.audio_format, config.sync.interval()).map_err(setup)?;

        let (video_tx, video_rx) = edge(config.sync.video_policy);
        let (audio_tx, audio_rx) = edge(config.sync.audio_policy);
        let mut edges: Vec<Box<dyn Discard>> =
            vec![Box::new(video_rx.monitor()), Box::new(audio_rx.monitor())];
        let (transcript_tx, transcript_rx) = match &transcriber {
            Some(_) => {
                let (tx, rx) = edge(config.sync.transcript_policy);
                edges.push(Box::new(rx.monitor()));
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let inputs = SyncInputs {
            video: video_rx,
            audio: audio_rx,
            transcript: transcript_rx,
        };
        let (perceptions, stats) = sync(inputs, &config.sync, clock).map_err(setup)?;

        let video_input = connector
            .open(video_endpoint, video_stream, timeout)
            .await
            .map_err(|source| SessionError::Connect {
                stream: video_stream.name.clone(),
                source,
            })?;
        let audio_input = connector
            .open(audio_endpoint, audio_stream, timeout)
            .await
            .map_err(|source| SessionError::Connect {
                stream: audio_stream.name.clone(),
                source,
            })?;

        let publisher = Arc::new(
            FanoutPublisher::<Perception>::bind(&config.output.address)
                .await
                .map_err(SessionError::Publisher)?,
        );
        let (rates, rates_rx) = watch::channel((0.0, 0.0));
        let beacon = match HeartbeatBeacon::start(
            &format!("tcp://*:{}", config.heartbeat.port),
            &config.heartbeat,
            clock,
            rates_rx,
        )
        .await
        {
            Ok(beacon) => beacon,
            Err(err) => {
                publisher.close().await;
                return Err(SessionError::Heartbeat(err));
            }
        };

        let hub_process = {
            let host = &config.advertise_host;
            let process = Process::new(
                config.hub_process.clone(),
                vec![
                    Endpoint::TcpSource {
                        host: host.clone(),
                        port: beacon.local_addr().port(),
                        stream: StreamDescriptor::new(&config.heartbeat.stream_name, HEARTBEAT_TYPE),
                    },
                    Endpoint::PubSubSource {
                        address: format!("tcp://{host}:{}", publisher.local_addr().port()),
                        streams: vec![StreamDescriptor::new(&config.output.topic, PERCEPTION_TYPE)],
                    },
                ],
            );
            match &config.target.version {
                Some(version) => process.with_version(version.clone()),
                None => process,
            }
        };

        // Nothing below can fail.
        let worker = transcriber.zip(transcript_tx).map(|(transcriber, tx)| {
            TranscriptWorker::spawn(transcriber, config.sync.audio_format, tx)
        });

        let monitor = Arc::new(HeartbeatMonitor::new(config.heartbeat.timeout()));
        let io_cancel = CancellationToken::new();
        let io_tasks = vec![
            tokio::spawn(pump_video(
                video_input,
                video_tx,
                monitor.clone(),
                io_cancel.clone(),
            )),
            tokio::spawn(pump_audio(
                audio_input,
                audio_tx,
                reframer,
                worker.as_ref().map(TranscriptWorker::submitter),
                monitor.clone(),
                io_cancel.clone(),
            )),
        ];

        let stale = Arc::new(AtomicBool::new(false));
        let pacing_cancel = CancellationToken::new();
        let pacing_task = tokio::spawn(publish_perceptions(
            perceptions,
            publisher.clone(),
            config.output.topic.clone(),
            stale.clone(),
            pacing_cancel.clone(),
        ));

        info!(
            process = %process.name,
            output = %publisher.local_addr(),
            heartbeat = %beacon.local_addr(),
            fps = config.sync.fps,
            "Session started"
        );

        let initial_stats = *stats.borrow();
        Ok(Self {
            _guards: [
                pacing_cancel.clone().drop_guard(),
                io_cancel.clone().drop_guard(),
            ],
            process,
            hub_process,
            advertised: false,
            publisher,
            beacon,
            monitor,
            stale,
            last_sample: (Instant::now(), initial_stats),
            stats,
            rates,
            clock_offset,
            pacing_cancel,
            pacing_task,
            io_cancel,
            io_tasks,
            worker,
            edges,
        })
    }

    /// The capture process this session reads from.
    pub fn process(&self) -> &Process {
        &self.process
    }

    /// The process the hub advertises for this session.
    pub fn hub_process(&self) -> &Process {
        &self.hub_process
    }

    pub fn publisher_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    pub fn heartbeat_addr(&self) -> SocketAddr {
        self.beacon.local_addr()
    }

    pub fn clock_offset(&self) -> TimeDelta {
        self.clock_offset
    }

    pub fn stats(&self) -> SyncStats {
        *self.stats.borrow()
    }

    /// Liveness of the capture process, judged by data arrivals.
    pub fn liveness(&self) -> Liveness {
        self.monitor.liveness()
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    /// Flags subsequent perceptions as stale.
    pub fn set_stale(&self, stale: bool) {
        self.stale.store(stale, Ordering::Release);
    }

    /// Updates the rates carried by the heartbeat and returns the
    /// current liveness.
    pub fn refresh(&mut self) -> Liveness {
        let now = Instant::now();
        let stats = *self.stats.borrow();
        let (since, previous) = self.last_sample;
        let elapsed = now.duration_since(since).as_secs_f32();

        if elapsed > 0.0 {
            let emitted = (stats.emitted - previous.emitted) as f32 / elapsed;
            let video = (stats.video_received - previous.video_received) as f32 / elapsed;
            self.rates.send_replace((emitted, video));
            self.last_sample = (now, stats);
        }

        self.monitor.liveness()
    }

    /// Adds the hub process to `registry`, once.
    pub fn advertise(&mut self, registry: &Registry) {
        if self.advertised {
            return;
        }
        if let Some(old) = registry.replace(self.hub_process.clone()) {
            debug!(process = %old.name, "Replaced a stale hub advertisement");
        }
        self.advertised = true;
        info!(process = %self.hub_process.name, "Hub process advertised");
    }

    /// Stops the session and withdraws the hub advertisement.
    ///
    /// Ticks stop first, then the input connections close, then pending
    /// samples are discarded and finally the outputs are released.
    pub async fn teardown(self, registry: &Registry) {
        self.pacing_cancel.cancel();
        if let Err(err) = self.pacing_task.await {
            warn!(error = %err, "Pacing task failed");
        }

        self.io_cancel.cancel();
        for task in self.io_tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Input task failed");
            }
        }
        if let Some(worker) = self.worker {
            worker.stop().await;
        }

        let discarded: usize = self.edges.iter().map(|edge| edge.discard()).sum();
        debug!(discarded, "Discarded pending samples");

        self.publisher.close().await;
        self.beacon.stop().await;

        // The capture process entry belongs to its peer and leaves with
        // the peer's withdrawal or disconnect.
        if self.advertised {
            registry.try_remove(&self.hub_process.name);
        }

        info!(process = %self.process.name, "Session torn down");
    }
}

/// Forwards one inbound stream until it ends, fails or is cancelled.
///
/// `deliver` returns false once the consumer is gone.
async fn pump<F>(
    name: &'static str,
    mut input: InboundStream,
    monitor: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
    mut deliver: F,
) where
    F: FnMut(Duration, SensorPayload) -> bool,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = input.next() => message,
        };

        match message {
            Some(Ok(message)) => {
                monitor.beat();
                if !deliver(message.timestamp, message.payload) {
                    break;
                }
            }
            Some(Err(err)) => {
                warn!(stream = name, error = %err, "Input stream failed");
                break;
            }
            None => {
                info!(stream = name, "Input stream closed");
                break;
            }
        }
    }
}

async fn pump_video(
    input: InboundStream,
    edge: EdgeSender<TimestampedMessage<ImageFrame>>,
    monitor: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
) {
    pump("video", input, monitor, cancel, |timestamp, payload| match payload {
        SensorPayload::Image(frame) => {
            edge.push(TimestampedMessage::new(timestamp, frame)) != Delivery::Disconnected
        }
        other => {
            debug!(kind = other.kind(), "Ignoring a non-image payload");
            true
        }
    })
    .await
}

async fn pump_audio(
    input: InboundStream,
    edge: EdgeSender<TimestampedMessage<AudioChunk>>,
    mut reframer: Reframer,
    transcriber: Option<mpsc::UnboundedSender<TimestampedMessage<AudioChunk>>>,
    monitor: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
) {
    pump("audio", input, monitor, cancel, |timestamp, payload| {
        let chunk = match payload {
            SensorPayload::Audio(chunk) => chunk,
            other => {
                debug!(kind = other.kind(), "Ignoring a non-audio payload");
                return true;
            }
        };

        for frame in reframer.push(TimestampedMessage::new(timestamp, chunk)) {
            if let Some(transcriber) = &transcriber {
                let _ = transcriber.send(frame.clone());
            }
            if edge.push(frame) == Delivery::Disconnected {
                return false;
            }
        }
        true
    })
    .await
}

async fn publish_perceptions(
    mut perceptions: PerceptionStream<'static>,
    publisher: Arc<FanoutPublisher<Perception>>,
    topic: String,
    stale: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let mut perception = tokio::select! {
            _ = cancel.cancelled() => break,
            perception = perceptions.next() => match perception {
                Some(perception) => perception,
                None => break,
            },
        };

        perception.stale = stale.load(Ordering::Acquire);
        match publisher.publish(&topic, perception.timestamp, &perception) {
            Ok(subscribers) => debug!(subscribers, timestamp = ?perception.timestamp, "Perception published"),
            Err(err) => warn!(error = %err, "Failed to publish a perception"),
        }
    }
    debug!("Pacing stopped");
}
