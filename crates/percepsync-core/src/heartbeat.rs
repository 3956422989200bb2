//! Liveness beacons and timeout detection.

use crate::{
    clock::Clock,
    publisher::FanoutPublisher,
    types::SensorPayload,
    wire::ProtocolError,
};
use eyre::{Result, ensure};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for the heartbeat link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between beacons.
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Number of missed periods after which the link counts as stale.
    pub timeout_multiple: u32,
    /// Port the hub serves its beacon on. Zero picks a free port.
    pub port: u16,
    /// Stream name the beacon is advertised under.
    pub stream_name: String,
}

impl Default for HeartbeatConfig {
    /// A 5 Hz beacon that goes stale after 5 s.
    fn default() -> Self {
        Self {
            period: Duration::from_millis(200),
            timeout_multiple: 25,
            port: 16000,
            stream_name: "ServerHeartbeat".into(),
        }
    }
}

impl HeartbeatConfig {
    pub fn timeout(&self) -> Duration {
        self.period * self.timeout_multiple
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.period.is_zero(),
            "heartbeat.period must be greater than zero"
        );
        ensure!(
            self.timeout_multiple > 0,
            "heartbeat.timeout_multiple must be greater than zero"
        );
        Ok(())
    }
}

/// One beacon: when it was sent and two rate metrics
/// (perceptions emitted per second, video frames received per second).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeartbeatSample {
    pub sent_at: Duration,
    pub rates: (f32, f32),
}

/// Liveness of a monitored link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Nothing has been observed yet.
    Waiting,
    Alive,
    /// The last beat is older than the timeout.
    Stale,
}

/// Tracks when the last liveness signal arrived.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    last_beat: Mutex<Option<Instant>>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_beat: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn beat(&self) {
        self.beat_at(Instant::now());
    }

    pub fn beat_at(&self, now: Instant) {
        let mut last = self.last_beat.lock();
        match *last {
            Some(prev) if prev >= now => {}
            _ => *last = Some(now),
        }
    }

    pub fn last_beat(&self) -> Option<Instant> {
        *self.last_beat.lock()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness_at(Instant::now())
    }

    pub fn liveness_at(&self, now: Instant) -> Liveness {
        match *self.last_beat.lock() {
            None => Liveness::Waiting,
            Some(last) if now.saturating_duration_since(last) > self.timeout => Liveness::Stale,
            Some(_) => Liveness::Alive,
        }
    }

    pub fn reset(&self) {
        *self.last_beat.lock() = None;
    }
}

/// Periodically publishes [HeartbeatSample]s to every connected peer.
pub struct HeartbeatBeacon {
    publisher: Arc<FanoutPublisher<SensorPayload>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatBeacon {
    /// Binds the beacon on `address` and starts ticking.
    ///
    /// `rates` supplies the metrics carried by each sample.
    pub async fn start<C>(
        address: &str,
        config: &HeartbeatConfig,
        clock: C,
        rates: watch::Receiver<(f32, f32)>,
    ) -> Result<Self, ProtocolError>
    where
        C: Clock,
    {
        let publisher = Arc::new(FanoutPublisher::bind(address).await?);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            let period = config.period;
            let topic = config.stream_name.clone();
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let now = clock.now();
                    let sample = HeartbeatSample {
                        sent_at: now,
                        rates: *rates.borrow(),
                    };
                    if let Err(err) =
                        publisher.publish(&topic, now, &SensorPayload::Heartbeat(sample))
                    {
                        warn!(error = %err, "Failed to publish heartbeat");
                    }
                }
                debug!("Heartbeat beacon stopped");
            }
        });

        Ok(Self {
            publisher,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "Heartbeat beacon task failed");
        }
        self.publisher.close().await;
    }
}
