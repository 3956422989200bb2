use crate::{heartbeat::HeartbeatConfig, types::AudioFormat};
use eyre::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Buffering policy of one producer-to-synchronizer edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Hold at most one pending message; a new arrival overwrites it.
    /// Bounds memory and favors freshness. Suitable for video and heartbeats.
    #[default]
    LatestOnly,

    /// Hold every pending message in arrival order and never drop.
    /// Suitable for audio, where completeness matters more than latency.
    Unlimited,
}

/// Parameters of the paced synchronizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Output rate in perceptions per second.
    pub fps: f64,

    /// How far behind the shared clock each tick's reference time lags,
    /// giving in-flight samples time to arrive.
    #[serde(with = "humantime_serde")]
    pub playout_delay: Duration,

    /// Look-back window of the audio join. Defaults to one pacing interval.
    #[serde(with = "humantime_serde")]
    pub join_window: Option<Duration>,

    /// Look-back window of the transcript join. Defaults to half an interval.
    #[serde(with = "humantime_serde")]
    pub transcript_window: Option<Duration>,

    pub audio_format: AudioFormat,
    pub video_policy: DeliveryPolicy,
    pub audio_policy: DeliveryPolicy,
    pub transcript_policy: DeliveryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fps: 5.0,
            playout_delay: Duration::from_millis(400),
            join_window: None,
            transcript_window: None,
            audio_format: AudioFormat::default(),
            video_policy: DeliveryPolicy::LatestOnly,
            audio_policy: DeliveryPolicy::Unlimited,
            transcript_policy: DeliveryPolicy::Unlimited,
        }
    }
}

/// Longest pacing interval a hub accepts.
const MAX_INTERVAL: Duration = Duration::from_secs(3600);

impl SyncConfig {
    /// The pacing interval, `1 / fps`. Saturates for rates too low to
    /// represent; `validate` refuses those.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.fps).unwrap_or(Duration::MAX)
    }

    pub fn join_window(&self) -> Duration {
        self.join_window.unwrap_or_else(|| self.interval())
    }

    pub fn transcript_window(&self) -> Duration {
        self.transcript_window
            .unwrap_or_else(|| self.interval() / 2)
    }

    /// Size of one reframed audio frame, covering exactly one interval.
    pub fn audio_frame_bytes(&self) -> usize {
        self.audio_format.bytes_for(self.interval())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.fps.is_finite() && self.fps > 0.0,
            "sync.fps must be a positive number"
        );
        let interval = Duration::try_from_secs_f64(1.0 / self.fps);
        ensure!(
            interval.is_ok_and(|interval| !interval.is_zero() && interval <= MAX_INTERVAL),
            "sync.fps must give an interval between 1ns and {:?}, got {}",
            MAX_INTERVAL,
            self.fps
        );
        ensure!(
            self.join_window() > Duration::ZERO,
            "sync.join_window must be greater than zero"
        );
        ensure!(
            self.audio_format.block_align() > 0 && self.audio_format.samples_per_sec > 0,
            "sync.audio_format must describe a non-empty sample"
        );
        Ok(())
    }
}

/// The capture process a hub waits for, and the streams it must expose.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub process: String,
    /// When set, a peer announcing another version is refused.
    pub version: Option<String>,
    pub video_stream: String,
    pub audio_stream: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::head_mounted()
    }
}

impl TargetConfig {
    /// A head-worn capture app announcing TCP sources and a remote clock.
    pub fn head_mounted() -> Self {
        Self {
            process: "PercepSyncHoloLensCapture".into(),
            version: Some("v1".into()),
            video_stream: "VideoEncodedImageCameraView".into(),
            audio_stream: "Audio".into(),
        }
    }

    /// A local webcam and microphone rig announcing pub/sub sources.
    pub fn local_devices() -> Self {
        Self {
            process: "LocalDevicesCapture".into(),
            version: None,
            video_stream: "webcam".into(),
            audio_stream: "audio".into(),
        }
    }
}

/// Where synchronized perceptions are published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub address: String,
    pub topic: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            address: "tcp://*:12345".into(),
            topic: "perception".into(),
        }
    }
}

/// Configuration of a synchronization hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub output: OutputConfig,
    pub sync: SyncConfig,
    pub heartbeat: HeartbeatConfig,

    /// Name under which the hub advertises itself once a session is up.
    pub hub_process: String,

    /// Host peers use to reach the endpoints this hub advertises.
    pub advertise_host: String,

    /// Bound on every connect or handshake wait.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            output: OutputConfig::default(),
            sync: SyncConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            hub_process: "PercepSync".into(),
            advertise_host: "127.0.0.1".into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.target.process.is_empty(),
            "target.process cannot be empty"
        );
        ensure!(
            !self.target.video_stream.is_empty() && !self.target.audio_stream.is_empty(),
            "target.video_stream and target.audio_stream cannot be empty"
        );
        ensure!(
            self.output.address.starts_with("tcp://"),
            "output.address must start with tcp://, got {}",
            self.output.address
        );
        ensure!(!self.output.topic.is_empty(), "output.topic cannot be empty");
        ensure!(!self.hub_process.is_empty(), "hub_process cannot be empty");
        ensure!(
            !self.connect_timeout.is_zero(),
            "connect_timeout must be greater than zero"
        );
        self.sync.validate()?;
        self.heartbeat.validate()?;
        Ok(())
    }
}
