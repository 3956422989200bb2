use super::{PeerMessage, RendezvousEvent, ServerMessage};
use crate::{
    registry::{Process, Registry, RegistryEvent, WireProcess},
    wire::{self, FramedStream, ProtocolError},
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A peer's connection to a rendezvous server.
///
/// The client keeps a mirror of the server's directory and reports the
/// differences between consecutive directories as [RendezvousEvent]s.
pub struct RendezvousClient {
    mirror: Arc<Registry>,
    outgoing: mpsc::UnboundedSender<PeerMessage>,
    events: flume::Receiver<RendezvousEvent>,
    generation: watch::Receiver<u64>,
    /// Announcements the server refused, by process name.
    rejections: Arc<Mutex<IndexMap<String, String>>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RendezvousClient {
    /// Connects to `address` and returns once the first directory has
    /// been received, failing after `timeout`.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, ProtocolError> {
        let addr = wire::dial_address(address, "127.0.0.1")?;
        let socket = wire::connect(&addr, timeout).await?;
        let local_addr = socket.local_addr()?;
        let mut conn = wire::framed(socket);

        let first = tokio::time::timeout(timeout, wire::recv::<ServerMessage>(&mut conn))
            .await
            .map_err(|_| ProtocolError::ConnectTimeout {
                addr: addr.clone(),
                timeout,
            })??
            .ok_or(ProtocolError::ConnectionLost)?;

        let mirror = Arc::new(Registry::new());
        let (events_tx, events) = flume::unbounded();
        let changes = mirror.subscribe();

        let ServerMessage::Directory { processes } = first else {
            return Err(ProtocolError::UnexpectedMessage(
                "expected the directory first".into(),
            ));
        };
        apply_directory(&mirror, processes, &events_tx);
        forward_changes(&changes, &events_tx);
        info!(server = %addr, processes = mirror.len(), "Connected to rendezvous server");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (generation_tx, generation) = watch::channel(1u64);
        let rejections = Arc::new(Mutex::new(IndexMap::new()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            Connection {
                conn,
                mirror: mirror.clone(),
                changes,
                events: events_tx,
                outgoing: outgoing_rx,
                generation: generation_tx,
                rejections: rejections.clone(),
                cancel: cancel.clone(),
            }
            .run(),
        );

        Ok(Self {
            mirror,
            outgoing,
            events,
            generation,
            rejections,
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The local copy of the server's directory.
    pub fn mirror(&self) -> &Arc<Registry> {
        &self.mirror
    }

    /// The event stream. Each event is delivered to one receiver only.
    pub fn events(&self) -> flume::Receiver<RendezvousEvent> {
        self.events.clone()
    }

    /// Asks the server to add `process` to the directory.
    pub fn announce(&self, process: &Process) -> Result<(), ProtocolError> {
        self.send(PeerMessage::Announce {
            process: WireProcess::from(process),
        })
    }

    /// Asks the server to drop a process this client announced.
    pub fn withdraw(&self, name: &str) -> Result<(), ProtocolError> {
        self.send(PeerMessage::Withdraw {
            name: name.to_string(),
        })
    }

    fn send(&self, message: PeerMessage) -> Result<(), ProtocolError> {
        self.outgoing
            .send(message)
            .map_err(|_| ProtocolError::ConnectionLost)
    }

    /// Announces `process` and waits until the server lists it.
    ///
    /// Fails with [ProtocolError::RejectedProcess] when the server
    /// refuses it, for example because another peer holds the name.
    pub async fn register(
        &self,
        process: &Process,
        timeout: Duration,
    ) -> Result<Process, ProtocolError> {
        self.rejections.lock().shift_remove(&process.name);
        self.announce(process)?;

        let mut generation = self.generation.clone();
        let wait = async {
            loop {
                generation.borrow_and_update();
                if let Some(reason) = self.rejections.lock().shift_remove(&process.name) {
                    return Err(ProtocolError::RejectedProcess {
                        name: process.name.clone(),
                        source: Box::new(ProtocolError::Refused(reason)),
                    });
                }
                match self.mirror.get(&process.name) {
                    Some(listed) if listed == *process => return Ok(listed),
                    _ => {}
                }
                if generation.changed().await.is_err() {
                    return Err(ProtocolError::ConnectionLost);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ProtocolError::ConnectTimeout {
                addr: format!("process {}", process.name),
                timeout,
            })?
    }

    /// Waits until the directory lists a process called `name`.
    pub async fn wait_for_process(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Process, ProtocolError> {
        let mut generation = self.generation.clone();
        let wait = async {
            loop {
                if let Some(process) = self.mirror.get(name) {
                    return Ok(process);
                }
                if generation.changed().await.is_err() {
                    return Err(ProtocolError::ConnectionLost);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ProtocolError::ConnectTimeout {
                addr: format!("process {name}"),
                timeout,
            })?
    }

    /// Closes the connection. Processes announced by this client are
    /// removed by the server.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct Connection {
    conn: FramedStream,
    mirror: Arc<Registry>,
    changes: flume::Receiver<RegistryEvent>,
    events: flume::Sender<RendezvousEvent>,
    outgoing: mpsc::UnboundedReceiver<PeerMessage>,
    generation: watch::Sender<u64>,
    rejections: Arc<Mutex<IndexMap<String, String>>>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(mut self) {
        let lost = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break false,
                message = self.outgoing.recv() => {
                    let Some(message) = message else { break false };
                    if let Err(err) = wire::send(&mut self.conn, &message).await {
                        debug!(error = %err, "Unable to reach the rendezvous server");
                        break true;
                    }
                }
                message = wire::recv::<ServerMessage>(&mut self.conn) => match message {
                    Ok(Some(ServerMessage::Directory { processes })) => {
                        apply_directory(&self.mirror, processes, &self.events);
                        forward_changes(&self.changes, &self.events);
                        self.generation.send_modify(|generation| *generation += 1);
                    }
                    Ok(Some(ServerMessage::Rejected { name, reason })) => {
                        warn!(process = %name, reason = %reason, "The server refused the process");
                        self.rejections.lock().insert(name.clone(), reason.clone());
                        let err = ProtocolError::RejectedProcess {
                            name,
                            source: Box::new(ProtocolError::Refused(reason)),
                        };
                        let _ = self.events.send(RendezvousEvent::error(err));
                        self.generation.send_modify(|generation| *generation += 1);
                    }
                    Ok(None) => break true,
                    Err(ProtocolError::Malformed(err)) => {
                        warn!(error = %err, "Malformed directory");
                        let _ = self.events.send(RendezvousEvent::error(ProtocolError::Malformed(err)));
                    }
                    Err(err) => {
                        debug!(error = %err, "Rendezvous connection failed");
                        break true;
                    }
                },
            }
        };

        if lost {
            warn!("Lost the rendezvous server");
            let _ = self
                .events
                .send(RendezvousEvent::error(ProtocolError::ConnectionLost));
        }
    }
}

/// Brings `mirror` in line with a received directory.
///
/// Processes that fail to convert are reported and left out.
fn apply_directory(
    mirror: &Registry,
    processes: Vec<WireProcess>,
    events: &flume::Sender<RendezvousEvent>,
) {
    let mut incoming = IndexMap::with_capacity(processes.len());
    for process in processes {
        match Process::try_from(process) {
            Ok(process) => {
                incoming.insert(process.name.clone(), process);
            }
            Err(err) => {
                warn!(error = %err, "Ignoring an invalid process in the directory");
                let _ = events.send(RendezvousEvent::error(err));
            }
        }
    }

    for existing in mirror.snapshot().iter() {
        if !incoming.contains_key(&existing.name) {
            mirror.try_remove(&existing.name);
        }
    }

    for (name, process) in incoming {
        match mirror.get(&name) {
            None => {
                let _ = mirror.add(process);
            }
            Some(current) if current != process => {
                mirror.replace(process);
            }
            Some(_) => {}
        }
    }
}

/// Moves mirror changes onto the event channel in mutation order.
fn forward_changes(
    changes: &flume::Receiver<RegistryEvent>,
    events: &flume::Sender<RendezvousEvent>,
) {
    for change in changes.try_iter() {
        let _ = events.send(RendezvousEvent::from(change));
    }
}
