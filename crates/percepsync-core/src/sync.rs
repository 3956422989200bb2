use crate::{
    clock::Clock,
    config::SyncConfig,
    edge::EdgeReceiver,
    state::{SyncState, SyncStats, TickOutcome},
    types::{AudioChunk, ImageFrame, Perception, PerceptionStream, TimestampedMessage},
};
use eyre::{Result, ensure};
use futures::{StreamExt, stream};
use std::time::Duration;
use tokio::{
    sync::watch,
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, warn};

/// The edges feeding one synchronizer.
pub struct SyncInputs {
    pub video: EdgeReceiver<TimestampedMessage<ImageFrame>>,
    /// Audio already reframed to one pacing interval per message.
    pub audio: EdgeReceiver<TimestampedMessage<AudioChunk>>,
    pub transcript: Option<EdgeReceiver<TimestampedMessage<String>>>,
}

impl SyncInputs {
    /// Whether both mandatory producers are gone.
    fn is_closed(&self) -> bool {
        self.video.is_closed() && self.audio.is_closed()
    }
}

/// Pace the input edges into a stream of perceptions, one per tick
/// of `1 / fps`.
///
/// Each tick samples the edges, computes the reference time as the
/// clock's current time minus the playout delay, and joins the
/// buffered samples against it. Ticks lacking a frame or audio emit
/// nothing. The stream ends once both mandatory edges are closed and
/// the remaining samples no longer produce output.
///
/// The function returns the output stream and a watch channel
/// carrying the running [SyncStats].
pub fn sync<C>(
    inputs: SyncInputs,
    config: &SyncConfig,
    clock: C,
) -> Result<(PerceptionStream<'static>, watch::Receiver<SyncStats>)>
where
    C: Clock,
{
    config.validate()?;
    let interval = config.interval();
    ensure!(interval > Duration::ZERO);

    let (stats_tx, stats_rx) = watch::channel(SyncStats::default());

    let pacer = Pacer {
        state: SyncState::new(config.join_window(), config.transcript_window()),
        inputs,
        clock,
        interval,
        playout_delay: config.playout_delay,
        ticker: None,
        stats_tx,
    };

    let stream = stream::unfold(pacer, |mut pacer| async move {
        let perception = pacer.next().await?;
        Some((perception, pacer))
    });

    Ok((stream.boxed(), stats_rx))
}

struct Pacer<C> {
    state: SyncState,
    inputs: SyncInputs,
    clock: C,
    interval: Duration,
    playout_delay: Duration,
    ticker: Option<Interval>,
    stats_tx: watch::Sender<SyncStats>,
}

impl<C> Pacer<C>
where
    C: Clock,
{
    async fn next(&mut self) -> Option<Perception> {
        loop {
            // The timer is created lazily so that it binds to the
            // runtime polling the stream.
            let ticker = self.ticker.get_or_insert_with(|| {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            });
            ticker.tick().await;

            let closed = self.inputs.is_closed();
            self.pull();

            let reference = self.clock.now().saturating_sub(self.playout_delay);
            let outcome = self.state.tick(reference);
            self.stats_tx.send_replace(self.state.stats());

            match outcome {
                TickOutcome::Emit(perception) => return Some(perception),
                _ if closed => {
                    debug!("Synchronizer inputs closed");
                    return None;
                }
                TickOutcome::NoFrame => {
                    debug!(reference = ?reference, "No video frame yet, tick skipped");
                }
                TickOutcome::AudioStalled => {
                    warn!(reference = ?reference, "Audio path stalled, tick suppressed");
                }
            }
        }
    }

    fn pull(&mut self) {
        for frame in self.inputs.video.drain() {
            self.state.push_frame(frame);
        }
        for frame in self.inputs.audio.drain() {
            self.state.push_audio_frame(frame);
        }
        if let Some(transcripts) = &self.inputs.transcript {
            for transcript in transcripts.drain() {
                self.state.push_transcript(transcript);
            }
        }
    }
}
