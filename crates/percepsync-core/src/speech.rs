//! Speech-to-text on the reframed audio stream.
//!
//! Recognition itself is delegated to a [Transcriber]. The
//! [TranscriptWorker] feeds it one audio frame at a time, in order,
//! and pushes each recognized utterance onto the transcript edge.

use crate::{
    edge::{Delivery, EdgeSender},
    types::{AudioChunk, AudioFormat, TimestampedMessage},
};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A speech recognizer.
pub trait Transcriber: Send + Sync + 'static {
    /// Recognizes speech in one audio frame. `None` means nothing was
    /// recognized.
    fn transcribe(
        &self,
        audio: AudioChunk,
        format: AudioFormat,
    ) -> BoxFuture<'static, eyre::Result<Option<String>>>;
}

/// Runs a [Transcriber] over submitted audio frames, one request at a
/// time.
pub struct TranscriptWorker {
    requests: mpsc::UnboundedSender<TimestampedMessage<AudioChunk>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TranscriptWorker {
    pub fn spawn(
        transcriber: Arc<dyn Transcriber>,
        format: AudioFormat,
        output: EdgeSender<TimestampedMessage<String>>,
    ) -> Self {
        let (requests, mut rx) = mpsc::unbounded_channel::<TimestampedMessage<AudioChunk>>();
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                loop {
                    let request = tokio::select! {
                        _ = cancel.cancelled() => break,
                        request = rx.recv() => match request {
                            Some(request) => request,
                            None => break,
                        },
                    };

                    let timestamp = request.timestamp;
                    let response = tokio::select! {
                        _ = cancel.cancelled() => break,
                        response = transcriber.transcribe(request.payload, format) => response,
                    };

                    match response {
                        Ok(Some(text)) if !text.trim().is_empty() => {
                            debug!(text = %text, "Recognized speech");
                            let delivery = output.push(TimestampedMessage::new(timestamp, text));
                            if delivery == Delivery::Disconnected {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "Speech recognition failed"),
                    }
                }
                debug!("Transcript worker stopped");
            }
        });

        Self {
            requests,
            cancel,
            task,
        }
    }

    /// Queues an audio frame. Returns false once the worker has stopped.
    pub fn submit(&self, frame: TimestampedMessage<AudioChunk>) -> bool {
        self.requests.send(frame).is_ok()
    }

    /// A cloneable handle for submitting frames from another task.
    pub fn submitter(&self) -> mpsc::UnboundedSender<TimestampedMessage<AudioChunk>> {
        self.requests.clone()
    }

    /// Cancels the in-flight request and discards queued ones.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "Transcript worker failed");
        }
    }
}
