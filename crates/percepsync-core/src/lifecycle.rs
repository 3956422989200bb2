//! The session state machine of a hub.

use crate::heartbeat::Liveness;
use std::fmt;
use tokio::sync::watch;
use tracing::{info, warn};

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    ProcessRemoved,
    ProtocolError,
    ConstructionFailed,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    WaitingForPeer,
    Connecting,
    Active,
    /// Output continues but is flagged stale.
    Degraded,
    TornDown(TeardownReason),
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::WaitingForPeer => write!(f, "waiting for peer"),
            LifecycleState::Connecting => write!(f, "connecting"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Degraded => write!(f, "degraded"),
            LifecycleState::TornDown(reason) => write!(f, "torn down ({reason:?})"),
        }
    }
}

/// Tracks the lifecycle state and publishes every transition.
///
/// Transitions not allowed from the current state are ignored and
/// reported as `false`, which makes repeated teardown requests harmless.
#[derive(Debug)]
pub struct Lifecycle {
    status: watch::Sender<LifecycleState>,
    last_teardown: Option<TeardownReason>,
    teardowns: u64,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (status, _) = watch::channel(LifecycleState::WaitingForPeer);
        Self {
            status,
            last_teardown: None,
            teardowns: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.status.subscribe()
    }

    pub fn last_teardown(&self) -> Option<TeardownReason> {
        self.last_teardown
    }

    /// Number of sessions torn down so far.
    pub fn teardowns(&self) -> u64 {
        self.teardowns
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.status.send_replace(next);
        info!(from = %previous, to = %next, "Lifecycle transition");
    }

    pub fn begin_connecting(&self) -> bool {
        if self.state() != LifecycleState::WaitingForPeer {
            return false;
        }
        self.transition(LifecycleState::Connecting);
        true
    }

    pub fn mark_active(&self) -> bool {
        if self.state() != LifecycleState::Connecting {
            return false;
        }
        self.transition(LifecycleState::Active);
        true
    }

    /// Applies a liveness observation. Returns the new state if it
    /// changed.
    pub fn observe_liveness(&self, liveness: Liveness) -> Option<LifecycleState> {
        let next = match (self.state(), liveness) {
            (LifecycleState::Connecting, Liveness::Alive) => LifecycleState::Active,
            (LifecycleState::Active, Liveness::Stale) => {
                warn!("No heartbeat within the timeout, output is stale");
                LifecycleState::Degraded
            }
            (LifecycleState::Degraded, Liveness::Alive) => LifecycleState::Active,
            _ => return None,
        };
        self.transition(next);
        Some(next)
    }

    /// Moves a live session to `TornDown`. Returns false when there is
    /// nothing to tear down.
    pub fn tear_down(&mut self, reason: TeardownReason) -> bool {
        match self.state() {
            LifecycleState::Connecting | LifecycleState::Active | LifecycleState::Degraded => {
                self.last_teardown = Some(reason);
                self.teardowns += 1;
                self.transition(LifecycleState::TornDown(reason));
                true
            }
            LifecycleState::WaitingForPeer | LifecycleState::TornDown(_) => false,
        }
    }

    /// Returns from `TornDown` to waiting for the next peer.
    pub fn reset(&self) -> bool {
        if !matches!(self.state(), LifecycleState::TornDown(_)) {
            return false;
        }
        self.transition(LifecycleState::WaitingForPeer);
        true
    }
}
