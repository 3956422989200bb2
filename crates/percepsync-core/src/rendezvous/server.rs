use super::{PeerMessage, RendezvousEvent, ServerMessage};
use crate::{
    registry::{Process, Registry},
    wire::{self, FramedStream, ProtocolError},
};
use bytes::Bytes;
use futures::SinkExt;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Directory frames kept for slow peers. Peers that fall further behind
/// are sent a fresh snapshot instead.
const DIRECTORY_BACKLOG: usize = 16;

/// Accepts peers, merges their processes into the registry and keeps
/// every peer's view of the directory current.
pub struct RendezvousServer {
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    events: flume::Receiver<RendezvousEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RendezvousServer {
    /// Starts serving on `address` (`host:port`, or `tcp://host:port`).
    ///
    /// Processes added to `registry` by other means, such as the hub's
    /// own advertisement, are broadcast like announced ones.
    pub async fn bind(address: &str, registry: Arc<Registry>) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(wire::bind_address(address)?).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let (events_tx, events) = flume::unbounded();
        let (directory_tx, _) = broadcast::channel(DIRECTORY_BACKLOG);

        let changes = registry.subscribe();
        let broadcast_task = tokio::spawn({
            let registry = registry.clone();
            let events_tx = events_tx.clone();
            let directory_tx = directory_tx.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    let change = tokio::select! {
                        _ = cancel.cancelled() => break,
                        change = changes.recv_async() => match change {
                            Ok(change) => change,
                            Err(_) => break,
                        },
                    };

                    let _ = events_tx.send(RendezvousEvent::from(change));
                    match encode_directory(&registry) {
                        Ok(frame) => {
                            let _ = directory_tx.send(frame);
                        }
                        Err(err) => warn!(error = %err, "Unable to encode the directory"),
                    }
                }
            }
        });

        let accept_task = tokio::spawn({
            let registry = registry.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    let (socket, peer) = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok(accepted) => accepted,
                            Err(err) => {
                                warn!(error = %err, "Rendezvous server failed to accept");
                                continue;
                            }
                        },
                    };
                    debug!(peer = %peer, "Peer connected");

                    let connection = PeerConnection {
                        registry: registry.clone(),
                        events: events_tx.clone(),
                        directory: directory_tx.subscribe(),
                        cancel: cancel.child_token(),
                        owned: Vec::new(),
                    };
                    tokio::spawn(async move {
                        connection.run(socket, peer).await;
                    });
                }
            }
        });

        info!(addr = %local_addr, "Rendezvous server listening");
        Ok(Self {
            registry,
            local_addr,
            events,
            cancel,
            tasks: vec![broadcast_task, accept_task],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The event stream. Each event is delivered to one receiver only.
    pub fn events(&self) -> flume::Receiver<RendezvousEvent> {
        self.events.clone()
    }

    /// Disconnects every peer and stops listening.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn encode_directory(registry: &Registry) -> Result<Bytes, ProtocolError> {
    let snapshot = registry.snapshot();
    wire::encode(&ServerMessage::directory(snapshot.iter()))
}

/// Serves one peer for the lifetime of its connection.
struct PeerConnection {
    registry: Arc<Registry>,
    events: flume::Sender<RendezvousEvent>,
    directory: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
    /// Names of the processes this peer announced.
    owned: Vec<String>,
}

impl PeerConnection {
    async fn run(mut self, socket: TcpStream, peer: SocketAddr) {
        if let Err(err) = socket.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "Unable to disable Nagle");
        }
        let mut conn = wire::framed(socket);

        if let Err(err) = self.send_snapshot(&mut conn).await {
            debug!(peer = %peer, error = %err, "Peer dropped before the first directory");
            return;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = wire::recv::<PeerMessage>(&mut conn) => match message {
                    Ok(Some(message)) => {
                        if let Some(reply) = self.handle(message, peer)
                            && wire::send(&mut conn, &reply).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(ProtocolError::Malformed(err)) => {
                        warn!(peer = %peer, error = %err, "Malformed message from peer");
                        self.report(ProtocolError::Malformed(err));
                    }
                    Err(err) => {
                        debug!(peer = %peer, error = %err, "Peer connection failed");
                        break;
                    }
                },
                frame = self.directory.recv() => {
                    let sent = match frame {
                        Ok(frame) => conn.send(frame).await.map_err(ProtocolError::from),
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            self.send_snapshot(&mut conn).await
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(peer = %peer, "Peer disconnected");
        for name in self.owned.drain(..) {
            self.registry.try_remove(&name);
        }
    }

    async fn send_snapshot(&self, conn: &mut FramedStream) -> Result<(), ProtocolError> {
        conn.send(encode_directory(&self.registry)?).await?;
        Ok(())
    }

    /// Applies one peer message. Returns the reply owed to the peer, if
    /// any.
    fn handle(&mut self, message: PeerMessage, peer: SocketAddr) -> Option<ServerMessage> {
        match message {
            PeerMessage::Announce { process } => {
                let name = process.name.clone();
                let added = Process::try_from(process)
                    .and_then(|process| self.registry.add(process).map_err(ProtocolError::from));
                match added {
                    Ok(()) => {
                        info!(peer = %peer, process = %name, "Process announced");
                        self.owned.push(name);
                        None
                    }
                    Err(err) => {
                        warn!(peer = %peer, error = %err, "Rejected announced process");
                        let reason = match &err {
                            ProtocolError::RejectedProcess { source, .. } => source.to_string(),
                            err => err.to_string(),
                        };
                        self.report(err);
                        Some(ServerMessage::Rejected { name, reason })
                    }
                }
            }
            PeerMessage::Withdraw { name } => {
                let Some(index) = self.owned.iter().position(|owned| *owned == name) else {
                    warn!(peer = %peer, process = %name, "Peer withdrew a process it does not own");
                    return None;
                };
                self.owned.swap_remove(index);
                self.registry.try_remove(&name);
                None
            }
        }
    }

    fn report(&self, err: ProtocolError) {
        let _ = self.events.send(RendezvousEvent::error(err));
    }
}
