use crate::types::{AudioChunk, AudioFormat, TimestampedMessage};
use bytes::BytesMut;
use eyre::{Result, ensure};
use std::time::Duration;

/// Regroups arbitrarily sized audio chunks into frames of a fixed byte
/// length.
///
/// Chunk timestamps mark the end of the chunk. Each emitted frame is
/// stamped with the instant its last byte was captured.
#[derive(Debug)]
pub struct Reframer {
    frame_bytes: usize,
    format: AudioFormat,
    pending: BytesMut,
}

impl Reframer {
    pub fn new(frame_bytes: usize, format: AudioFormat) -> Result<Self> {
        let align = format.block_align();
        ensure!(frame_bytes > 0, "audio frame size must be positive");
        ensure!(
            align > 0 && frame_bytes % align == 0,
            "audio frame size {frame_bytes} is not a multiple of the block align {align}"
        );

        Ok(Self {
            frame_bytes,
            format,
            pending: BytesMut::with_capacity(frame_bytes * 2),
        })
    }

    /// A reframer whose frames span exactly `interval` of audio.
    pub fn for_interval(format: AudioFormat, interval: Duration) -> Result<Self> {
        Self::new(format.bytes_for(interval), format)
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Bytes received but not yet emitted.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Appends a chunk and returns every frame that became complete.
    pub fn push(
        &mut self,
        chunk: TimestampedMessage<AudioChunk>,
    ) -> Vec<TimestampedMessage<AudioChunk>> {
        let chunk_end = chunk.timestamp;
        self.pending.extend_from_slice(&chunk.payload.data);

        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_bytes);
        while self.pending.len() >= self.frame_bytes {
            let data = self.pending.split_to(self.frame_bytes).freeze();
            let trailing = self.format.duration_of(self.pending.len());
            frames.push(TimestampedMessage::new(
                chunk_end.saturating_sub(trailing),
                AudioChunk { data },
            ));
        }
        frames
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
