//! Clock sources used to stamp and pace messages.
//!
//! A capture peer may export its clock so that the hub expresses tick
//! reference times in the peer's time base.

use crate::wire::{self, ProtocolError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A source of timestamps, expressed as time since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Duration;
}

/// Wall-clock time of this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        Utc::now()
            .signed_duration_since(DateTime::UNIX_EPOCH)
            .to_std()
            .unwrap_or_default()
    }
}

/// A clock shifted by a signed offset from a base clock.
#[derive(Debug, Clone, Copy)]
pub struct OffsetClock<C> {
    base: C,
    offset: TimeDelta,
}

impl<C> OffsetClock<C>
where
    C: Clock,
{
    pub fn new(base: C, offset: TimeDelta) -> Self {
        Self { base, offset }
    }

    pub fn offset(&self) -> TimeDelta {
        self.offset
    }
}

impl<C> Clock for OffsetClock<C>
where
    C: Clock,
{
    fn now(&self) -> Duration {
        shift(self.base.now(), self.offset)
    }
}

fn shift(time: Duration, offset: TimeDelta) -> Duration {
    let time = TimeDelta::from_std(time).unwrap_or(TimeDelta::MAX);
    time.checked_add(&offset)
        .and_then(|shifted| shifted.to_std().ok())
        .unwrap_or_default()
}

/// A reading of a remote clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockReading {
    pub now: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ClockRequest {}

/// Measures how far `remote` is ahead of `local`, compensating for half
/// the round trip.
pub async fn measure_offset<C>(
    remote: &str,
    local: &C,
    timeout: Duration,
) -> Result<TimeDelta, ProtocolError>
where
    C: Clock,
{
    let mut conn = wire::framed(wire::connect(remote, timeout).await?);

    let sent = local.now();
    wire::send(&mut conn, &ClockRequest {}).await?;
    let reading: ClockReading = tokio::time::timeout(timeout, wire::recv(&mut conn))
        .await
        .map_err(|_| ProtocolError::ConnectTimeout {
            addr: remote.to_string(),
            timeout,
        })??
        .ok_or_else(|| ProtocolError::UnexpectedMessage("clock closed before replying".into()))?;
    let received = local.now();

    let round_trip = received.saturating_sub(sent);
    let local_mid = TimeDelta::from_std(sent + round_trip / 2).unwrap_or(TimeDelta::MAX);
    let remote_now = TimeDelta::from_std(reading.now).unwrap_or(TimeDelta::MAX);
    Ok(remote_now - local_mid)
}

/// Answers clock requests with readings of a local clock.
pub struct ClockServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ClockServer {
    pub async fn bind<C>(address: &str, clock: C) -> Result<Self, ProtocolError>
    where
        C: Clock + Clone,
    {
        let listener = TcpListener::bind(wire::bind_address(address)?).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                loop {
                    let (socket, peer) = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok(accepted) => accepted,
                            Err(err) => {
                                warn!(error = %err, "Clock server failed to accept");
                                continue;
                            }
                        },
                    };

                    debug!(peer = %peer, "Clock client connected");
                    let clock = clock.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        let mut conn = wire::framed(socket);
                        loop {
                            let request = tokio::select! {
                                _ = cancel.cancelled() => break,
                                request = wire::recv::<ClockRequest>(&mut conn) => request,
                            };
                            match request {
                                Ok(Some(_)) => {
                                    let reading = ClockReading { now: clock.now() };
                                    if wire::send(&mut conn, &reading).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    debug!(peer = %peer, error = %err, "Clock client dropped");
                                    break;
                                }
                            }
                        }
                    });
                }
            }
        });

        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}
