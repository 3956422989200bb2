use crate::{
    buffer::Buffer,
    types::{AudioChunk, ImageFrame, Perception, TimestampedMessage},
};
use std::time::Duration;
use tracing::debug;

type Timed<T> = TimestampedMessage<T>;

/// Counters describing the synchronizer's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStats {
    pub ticks: u64,
    pub emitted: u64,
    /// Ticks suppressed because no frame was ever received.
    pub no_frame: u64,
    /// Ticks suppressed because no audio frame fell in the join window.
    pub audio_stalled: u64,
    pub video_received: u64,
    pub audio_received: u64,
    pub transcripts_received: u64,
    /// Messages dropped because their timestamp went backwards.
    pub out_of_order: u64,
    pub last_emitted: Option<Duration>,
}

/// Result of one pacing tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Emit(Perception),
    NoFrame,
    AudioStalled,
}

/// The join state of the synchronizer: per-stream buffers and the
/// held video frame.
#[derive(Debug)]
pub struct SyncState {
    video: Buffer<Timed<ImageFrame>>,
    held: Option<Timed<ImageFrame>>,
    audio: Buffer<Timed<AudioChunk>>,
    transcripts: Buffer<Timed<String>>,
    join_window: Duration,
    transcript_window: Duration,
    stats: SyncStats,
}

impl SyncState {
    pub fn new(join_window: Duration, transcript_window: Duration) -> Self {
        Self {
            video: Buffer::with_capacity(4),
            held: None,
            audio: Buffer::with_capacity(16),
            transcripts: Buffer::with_capacity(4),
            join_window,
            transcript_window,
            stats: SyncStats::default(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn push_frame(&mut self, frame: Timed<ImageFrame>) {
        self.stats.video_received += 1;
        if self.video.try_push(frame).is_err() {
            self.stats.out_of_order += 1;
            debug!("drop a late video frame");
        }
    }

    /// Accepts one reframed audio frame.
    pub fn push_audio_frame(&mut self, frame: Timed<AudioChunk>) {
        self.stats.audio_received += 1;
        if self.audio.try_push(frame).is_err() {
            self.stats.out_of_order += 1;
            debug!("drop a late audio frame");
        }
    }

    pub fn push_transcript(&mut self, transcript: Timed<String>) {
        self.stats.transcripts_received += 1;
        if self.transcripts.try_push(transcript).is_err() {
            self.stats.out_of_order += 1;
            debug!("drop a late transcript");
        }
    }

    /// Runs one pacing tick against `reference`.
    ///
    /// Video is sampled and held, audio and transcripts are joined with
    /// nearest-past semantics. Without a frame or an audio match, the
    /// tick emits nothing.
    pub fn tick(&mut self, reference: Duration) -> TickOutcome {
        self.stats.ticks += 1;

        if let Some(frame) = self.video.drain_until(reference) {
            self.held = Some(frame);
        }
        let Some(held) = &self.held else {
            self.stats.no_frame += 1;
            return TickOutcome::NoFrame;
        };

        let Some(audio) = self.audio.nearest_past(reference, self.join_window).cloned() else {
            self.audio
                .drop_before(reference.saturating_sub(self.join_window));
            self.stats.audio_stalled += 1;
            return TickOutcome::AudioStalled;
        };
        self.audio.drop_before(audio.timestamp);

        let transcript = match self
            .transcripts
            .take_nearest_past(reference, self.transcript_window)
        {
            Some(transcript) => transcript.payload,
            None => {
                self.transcripts
                    .drop_before(reference.saturating_sub(self.transcript_window));
                String::new()
            }
        };

        self.stats.emitted += 1;
        self.stats.last_emitted = Some(reference);

        TickOutcome::Emit(Perception {
            timestamp: reference,
            frame: held.payload.clone(),
            audio: audio.payload,
            transcript,
            stale: false,
        })
    }

    /// Drops every buffered sample, including the held frame.
    pub fn clear(&mut self) {
        self.video.clear();
        self.held = None;
        self.audio.clear();
        self.transcripts.clear();
    }
}
