use bytes::Bytes;
use chrono::TimeDelta;
use futures::{FutureExt, StreamExt, future::BoxFuture};
use indexmap::IndexMap;
use percepsync_core::{
    AudioChunk, Config, Endpoint, ImageFrame, OutputConfig, Process, ProtocolError, SensorPayload,
    StreamDescriptor, TimestampedMessage,
    source::{InboundStream, SourceConnector},
};
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const TARGET: &str = "PercepSyncHoloLensCapture";
pub const VIDEO: &str = "VideoEncodedImageCameraView";
pub const AUDIO: &str = "Audio";

pub type Feed = flume::Sender<TimestampedMessage<SensorPayload>>;

/// Serves inbound streams from in-memory channels, keyed by stream name.
///
/// Every `open` hands out a fresh receiver of the same channel, so a
/// session rebuilt after a teardown reads the same feed.
#[derive(Clone, Default)]
pub struct ChannelConnector {
    inputs: IndexMap<String, flume::Receiver<TimestampedMessage<SensorPayload>>>,
    offset: Option<TimeDelta>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream and returns the sender feeding it.
    pub fn feed(&mut self, stream: &str) -> Feed {
        let (tx, rx) = flume::unbounded();
        self.inputs.insert(stream.to_string(), rx);
        tx
    }

    #[allow(dead_code)]
    pub fn with_clock_offset(mut self, offset: TimeDelta) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl SourceConnector for ChannelConnector {
    fn open(
        &self,
        _endpoint: &Endpoint,
        stream: &StreamDescriptor,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<InboundStream, ProtocolError>> {
        let result = match self.inputs.get(&stream.name) {
            Some(rx) => Ok(rx.clone().into_stream().map(Ok).boxed()),
            None => Err(ProtocolError::UnsupportedEndpoint(stream.name.clone())),
        };
        futures::future::ready(result).boxed()
    }

    fn clock_offset(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<TimeDelta, ProtocolError>> {
        let result = self
            .offset
            .ok_or_else(|| ProtocolError::UnsupportedEndpoint(endpoint.to_string()));
        futures::future::ready(result).boxed()
    }
}

/// A capture process exposing the default video and audio streams.
pub fn capture_process(version: Option<&str>) -> Process {
    let process = Process::new(
        TARGET,
        vec![
            Endpoint::TcpSource {
                host: "127.0.0.1".into(),
                port: 20001,
                stream: StreamDescriptor::new(VIDEO, "percepsync.ImageFrame"),
            },
            Endpoint::TcpSource {
                host: "127.0.0.1".into(),
                port: 20002,
                stream: StreamDescriptor::new(AUDIO, "percepsync.AudioChunk"),
            },
        ],
    );
    match version {
        Some(version) => process.with_version(version),
        None => process,
    }
}

/// A hub configuration binding every port on loopback, chosen by the OS.
pub fn test_config() -> Config {
    let mut config = Config {
        output: OutputConfig {
            address: "tcp://127.0.0.1:0".into(),
            ..OutputConfig::default()
        },
        connect_timeout: TIMEOUT,
        ..Config::default()
    };
    config.heartbeat.port = 0;
    config.sync.fps = 50.0;
    config.sync.playout_delay = Duration::from_millis(40);
    config
}

pub fn image(seq: u8) -> SensorPayload {
    SensorPayload::Image(ImageFrame {
        width: 2,
        height: 1,
        stride: 8,
        pixel_data: Bytes::from(vec![seq; 8]),
    })
}

pub fn audio(bytes: usize) -> SensorPayload {
    SensorPayload::Audio(AudioChunk::new(vec![0u8; bytes]))
}

#[allow(dead_code)]
pub fn process_with(name: &str, port: u16) -> Process {
    Process::new(
        name,
        vec![Endpoint::TcpSource {
            host: "127.0.0.1".into(),
            port,
            stream: StreamDescriptor::new("Stream", "test.Stream"),
        }],
    )
}

/// Receives from `rx`, failing the test after [TIMEOUT].
#[allow(dead_code)]
pub async fn recv_within<T>(rx: &flume::Receiver<T>) -> T {
    tokio::time::timeout(TIMEOUT, rx.recv_async())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

/// Polls `condition` until it holds, failing the test after [TIMEOUT].
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
