//! Process discovery between capture peers and the hub.
//!
//! A [RendezvousServer] owns the authoritative [Registry](crate::Registry)
//! and broadcasts the whole directory after each change. A
//! [RendezvousClient] announces its own process and mirrors the
//! directory locally. Both sides report changes as the same
//! [RendezvousEvent]s.

mod client;
mod server;

pub use client::RendezvousClient;
pub use server::RendezvousServer;

use crate::{
    registry::{Process, RegistryEvent, WireProcess},
    wire::ProtocolError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Messages sent from a peer to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Announce { process: WireProcess },
    Withdraw { name: String },
}

/// Messages sent from the server to its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The complete directory, sent on connect and after every change.
    Directory { processes: Vec<WireProcess> },
    /// Sent to the announcing peer only, when its process was not added.
    Rejected { name: String, reason: String },
}

impl ServerMessage {
    pub fn directory<'a>(processes: impl IntoIterator<Item = &'a Process>) -> Self {
        ServerMessage::Directory {
            processes: processes.into_iter().map(WireProcess::from).collect(),
        }
    }
}

/// A change observed through the rendezvous protocol.
#[derive(Debug, Clone)]
pub enum RendezvousEvent {
    ProcessAdded(Process),
    ProcessRemoved(Process),
    /// A peer sent something that could not be applied. Only
    /// [fatal](ProtocolError::is_fatal) errors affect running sessions.
    Error(Arc<ProtocolError>),
}

impl RendezvousEvent {
    pub fn error(err: ProtocolError) -> Self {
        RendezvousEvent::Error(Arc::new(err))
    }
}

impl From<RegistryEvent> for RendezvousEvent {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::Added(process) => RendezvousEvent::ProcessAdded(process),
            RegistryEvent::Removed(process) => RendezvousEvent::ProcessRemoved(process),
        }
    }
}
