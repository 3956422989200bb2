//! The capture side of the system.
//!
//! A [CapturePeer] serves its sensor streams over TCP, announces them
//! through the rendezvous server, and follows the hub's heartbeat once
//! the hub advertises itself.

use crate::{
    clock::{ClockServer, SystemClock},
    config::DeliveryPolicy,
    endpoint::{Endpoint, StreamDescriptor},
    heartbeat::{HeartbeatConfig, HeartbeatMonitor, Liveness},
    publisher::{FanoutPublisher, Subscriber},
    registry::Process,
    rendezvous::{RendezvousClient, RendezvousEvent},
    types::SensorPayload,
};
use eyre::{Result, WrapErr, ensure, eyre};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A stream a capture peer serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub type_tag: String,
    /// How records reach a reader that falls behind.
    #[serde(default)]
    pub policy: DeliveryPolicy,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            policy: DeliveryPolicy::LatestOnly,
        }
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub process: String,
    pub version: Option<String>,
    /// Address of the rendezvous server.
    pub rendezvous: String,
    /// Interface the stream endpoints listen on.
    pub bind_host: String,
    /// Host the hub uses to reach the stream endpoints.
    pub advertise_host: String,
    pub streams: Vec<StreamSpec>,
    /// Whether to serve the local clock as a `RemoteClockSource`.
    pub export_clock: bool,
    /// Name of the hub process whose heartbeat is followed.
    pub hub_process: String,
    pub heartbeat: HeartbeatConfig,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            process: "PercepSyncHoloLensCapture".into(),
            version: Some("v1".into()),
            rendezvous: "127.0.0.1:13331".into(),
            bind_host: "0.0.0.0".into(),
            advertise_host: "127.0.0.1".into(),
            streams: vec![
                StreamSpec::new("VideoEncodedImageCameraView", "percepsync.ImageFrame"),
                StreamSpec::new("Audio", "percepsync.AudioChunk")
                    .with_policy(DeliveryPolicy::Unlimited),
            ],
            export_clock: true,
            hub_process: "PercepSync".into(),
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A running capture peer.
pub struct CapturePeer {
    client: RendezvousClient,
    process: Process,
    publishers: IndexMap<String, FanoutPublisher<SensorPayload>>,
    clock_server: Option<ClockServer>,
    hub_monitor: Arc<HeartbeatMonitor>,
    hub: Arc<Mutex<Option<Process>>>,
    cancel: CancellationToken,
    follower: JoinHandle<()>,
}

impl CapturePeer {
    /// Binds the stream endpoints, connects to the rendezvous server and
    /// waits until the server lists the announced process. Fails when the
    /// server refuses the process, for instance on a duplicate name.
    pub async fn start(config: CaptureConfig) -> Result<Self> {
        ensure!(!config.process.is_empty(), "process name cannot be empty");
        ensure!(!config.streams.is_empty(), "a capture peer needs at least one stream");
        let timeout = config.connect_timeout;
        let bind = format!("tcp://{}:0", config.bind_host);

        let mut publishers = IndexMap::new();
        let mut endpoints = Vec::new();
        for spec in &config.streams {
            let publisher = match FanoutPublisher::bind_with_policy(&bind, spec.policy).await {
                Ok(publisher) => publisher,
                Err(err) => {
                    release(&publishers, None).await;
                    return Err(err).wrap_err_with(|| format!("unable to serve stream {}", spec.name));
                }
            };
            endpoints.push(Endpoint::TcpSource {
                host: config.advertise_host.clone(),
                port: publisher.local_addr().port(),
                stream: StreamDescriptor::new(&spec.name, &spec.type_tag),
            });
            publishers.insert(spec.name.clone(), publisher);
        }

        let clock_server = if config.export_clock {
            match ClockServer::bind(&bind, SystemClock).await {
                Ok(server) => {
                    endpoints.push(Endpoint::RemoteClockSource {
                        host: config.advertise_host.clone(),
                        port: server.local_addr().port(),
                    });
                    Some(server)
                }
                Err(err) => {
                    release(&publishers, None).await;
                    return Err(err).wrap_err("unable to serve the clock");
                }
            }
        } else {
            None
        };

        let process = Process::new(config.process.clone(), endpoints);
        let process = match &config.version {
            Some(version) => process.with_version(version.clone()),
            None => process,
        };

        let client = match RendezvousClient::connect(&config.rendezvous, timeout).await {
            Ok(client) => client,
            Err(err) => {
                release(&publishers, clock_server).await;
                return Err(err).wrap_err_with(|| {
                    format!("unable to reach the rendezvous server {}", config.rendezvous)
                });
            }
        };
        let events = client.events();
        if let Err(err) = client.register(&process, timeout).await {
            client.shutdown().await;
            release(&publishers, clock_server).await;
            return Err(err).wrap_err_with(|| format!("unable to register {}", process.name));
        }
        info!(process = %process.name, "Capture process announced");

        let hub_monitor = Arc::new(HeartbeatMonitor::new(config.heartbeat.timeout()));
        let hub = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();
        let follower = tokio::spawn(
            HubFollower {
                hub_process: config.hub_process.clone(),
                version: config.version.clone(),
                stream: config.heartbeat.stream_name.clone(),
                timeout,
                monitor: hub_monitor.clone(),
                hub: hub.clone(),
                cancel: cancel.clone(),
            }
            .run(events),
        );

        Ok(Self {
            client,
            process,
            publishers,
            clock_server,
            hub_monitor,
            hub,
            cancel,
            follower,
        })
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    /// The hub process, once it has advertised itself.
    pub fn hub(&self) -> Option<Process> {
        self.hub.lock().clone()
    }

    pub fn hub_liveness(&self) -> Liveness {
        self.hub_monitor.liveness()
    }

    pub fn client(&self) -> &RendezvousClient {
        &self.client
    }

    /// Publishes one sample on a stream. Returns the number of readers.
    pub fn publish(&self, stream: &str, timestamp: Duration, payload: &SensorPayload) -> Result<usize> {
        let publisher = self
            .publishers
            .get(stream)
            .ok_or_else(|| eyre!("unknown stream {stream}"))?;
        Ok(publisher.publish(stream, timestamp, payload)?)
    }

    /// Waits until every stream has at least one reader.
    pub async fn wait_for_readers(&self, timeout: Duration) -> bool {
        for publisher in self.publishers.values() {
            if !publisher.wait_for_subscribers(1, timeout).await {
                return false;
            }
        }
        true
    }

    /// Withdraws the process and closes every endpoint.
    pub async fn stop(self) {
        if let Err(err) = self.client.withdraw(&self.process.name) {
            debug!(error = %err, "Unable to withdraw");
        }
        self.cancel.cancel();
        let _ = self.follower.await;
        self.client.shutdown().await;

        release(&self.publishers, self.clock_server).await;
        info!(process = %self.process.name, "Capture process stopped");
    }
}

/// Closes the stream endpoints and the clock endpoint.
async fn release(
    publishers: &IndexMap<String, FanoutPublisher<SensorPayload>>,
    clock_server: Option<ClockServer>,
) {
    for publisher in publishers.values() {
        publisher.close().await;
    }
    if let Some(server) = clock_server {
        server.stop().await;
    }
}

/// Tracks the hub process and feeds its heartbeat into a monitor.
struct HubFollower {
    hub_process: String,
    version: Option<String>,
    stream: String,
    timeout: Duration,
    monitor: Arc<HeartbeatMonitor>,
    hub: Arc<Mutex<Option<Process>>>,
    cancel: CancellationToken,
}

impl HubFollower {
    async fn run(self, events: flume::Receiver<RendezvousEvent>) {
        let mut following: Option<(CancellationToken, JoinHandle<()>)> = None;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            match event {
                RendezvousEvent::ProcessAdded(process) if process.name == self.hub_process => {
                    if let Some(expected) = &self.version
                        && process.version.as_ref() != Some(expected)
                    {
                        warn!(
                            process = %process.name,
                            version = ?process.version,
                            expected = %expected,
                            "Ignoring a hub with another version"
                        );
                        continue;
                    }
                    let Some(Endpoint::TcpSource { host, port, .. }) =
                        process.find_stream(&self.stream)
                    else {
                        warn!(process = %process.name, "The hub does not serve a heartbeat");
                        continue;
                    };

                    let address = format!("{host}:{port}");
                    stop_following(following.take()).await;
                    self.monitor.reset();
                    *self.hub.lock() = Some(process.clone());
                    info!(process = %process.name, heartbeat = %address, "Following the hub");

                    let cancel = self.cancel.child_token();
                    let task = tokio::spawn(follow_heartbeat(
                        address,
                        self.stream.clone(),
                        self.timeout,
                        self.monitor.clone(),
                        cancel.clone(),
                    ));
                    following = Some((cancel, task));
                }
                RendezvousEvent::ProcessRemoved(process) if process.name == self.hub_process => {
                    info!(process = %process.name, "The hub went away");
                    stop_following(following.take()).await;
                    self.monitor.reset();
                    *self.hub.lock() = None;
                }
                RendezvousEvent::Error(err) => {
                    warn!(error = %err, "Rendezvous error");
                    if err.is_fatal() {
                        break;
                    }
                }
                _ => {}
            }
        }

        stop_following(following).await;
    }
}

async fn stop_following(following: Option<(CancellationToken, JoinHandle<()>)>) {
    if let Some((cancel, task)) = following {
        cancel.cancel();
        let _ = task.await;
    }
}

async fn follow_heartbeat(
    address: String,
    stream: String,
    timeout: Duration,
    monitor: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
) {
    let mut subscriber =
        match Subscriber::<SensorPayload>::connect(&address, Some(&stream), timeout).await {
            Ok(subscriber) => subscriber,
            Err(err) => {
                warn!(heartbeat = %address, error = %err, "Unable to follow the hub heartbeat");
                return;
            }
        };

    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = subscriber.next() => envelope,
        };

        match envelope {
            Ok(Some(envelope)) => {
                if let SensorPayload::Heartbeat(sample) = envelope.payload {
                    monitor.beat();
                    debug!(rates = ?sample.rates, "Hub heartbeat");
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "Hub heartbeat failed");
                break;
            }
        }
    }
}
