use crate::heartbeat::HeartbeatSample;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Creates a timestamp from the message passed to the synchronizer.
pub trait WithTimestamp: Send {
    fn timestamp(&self) -> Duration;
}

/// A payload tagged with the instant it originated at.
///
/// Within one stream, timestamps are non-decreasing as delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedMessage<T> {
    pub timestamp: Duration,
    pub payload: T,
}

impl<T> TimestampedMessage<T> {
    pub fn new(timestamp: Duration, payload: T) -> Self {
        Self { timestamp, payload }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TimestampedMessage<U> {
        TimestampedMessage {
            timestamp: self.timestamp,
            payload: f(self.payload),
        }
    }
}

impl<T> WithTimestamp for TimestampedMessage<T>
where
    T: Send,
{
    fn timestamp(&self) -> Duration {
        self.timestamp
    }
}

/// A raw pixel image as delivered by the capture peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixel_data: Bytes,
}

/// A chunk of interleaved PCM audio.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioChunk {
    pub data: Bytes,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// PCM layout of the audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub samples_per_sec: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for AudioFormat {
    /// 16 kHz, 1 channel, 16-bit PCM.
    fn default() -> Self {
        Self {
            samples_per_sec: 16_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize).div_ceil(8)
    }

    pub fn avg_bytes_per_sec(&self) -> usize {
        self.samples_per_sec as usize * self.block_align()
    }

    /// Number of bytes covering `span`, rounded up to a whole sample block.
    pub fn bytes_for(&self, span: Duration) -> usize {
        let raw = (self.avg_bytes_per_sec() as u128 * span.as_nanos()).div_ceil(1_000_000_000);
        let align = self.block_align().max(1);
        (raw as usize).div_ceil(align) * align
    }

    /// Real-time span represented by `bytes` bytes.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let rate = self.avg_bytes_per_sec();
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((bytes as u128 * 1_000_000_000 / rate as u128) as u64)
    }
}

/// Payloads carried on the capture peer's stream endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SensorPayload {
    Image(ImageFrame),
    Audio(AudioChunk),
    Text(String),
    Heartbeat(HeartbeatSample),
}

impl SensorPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SensorPayload::Image(_) => "image",
            SensorPayload::Audio(_) => "audio",
            SensorPayload::Text(_) => "text",
            SensorPayload::Heartbeat(_) => "heartbeat",
        }
    }
}

/// The synchronized composite record emitted once per pacing tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perception {
    pub timestamp: Duration,
    pub frame: ImageFrame,
    pub audio: AudioChunk,
    /// Empty when speech-to-text is disabled or nothing was recognized.
    pub transcript: String,
    /// Set while the peer's liveness signal is overdue.
    pub stale: bool,
}

impl WithTimestamp for Perception {
    fn timestamp(&self) -> Duration {
        self.timestamp
    }
}

/// The stream returned by [sync](crate::sync()), emitting one
/// perception per successful pacing tick.
pub type PerceptionStream<'a> = BoxStream<'a, Perception>;
