//! The process directory shared by rendezvous servers and client mirrors.

use crate::{
    endpoint::{Endpoint, WireEndpoint},
    wire::ProtocolError,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// A named participant and the endpoints it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub name: String,
    pub version: Option<String>,
    pub endpoints: Vec<Endpoint>,
}

impl Process {
    pub fn new(name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            name: name.into(),
            version: None,
            endpoints,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Finds the endpoint serving the named stream.
    pub fn find_stream(&self, stream: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.stream(stream).is_some())
    }
}

/// Serialized form of [Process] as exchanged by the rendezvous protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireProcess {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub endpoints: Vec<WireEndpoint>,
}

impl From<&Process> for WireProcess {
    fn from(process: &Process) -> Self {
        Self {
            name: process.name.clone(),
            version: process.version.clone(),
            endpoints: process.endpoints.iter().map(WireEndpoint::from).collect(),
        }
    }
}

impl TryFrom<WireProcess> for Process {
    type Error = ProtocolError;

    fn try_from(wire: WireProcess) -> Result<Self, Self::Error> {
        let WireProcess {
            name,
            version,
            endpoints,
        } = wire;

        let endpoints = endpoints
            .into_iter()
            .map(Endpoint::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ProtocolError::RejectedProcess {
                name: name.clone(),
                source: Box::new(source),
            })?;

        Ok(Self {
            name,
            version,
            endpoints,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a process named {0} is already registered")]
    DuplicateName(String),

    #[error("no process named {0} is registered")]
    NotFound(String),
}

/// A change to the registry, emitted once per successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(Process),
    Removed(Process),
}

/// An immutable view of the registry at one point in time.
pub type Snapshot = Arc<Vec<Process>>;

/// In-memory directory mapping process names to processes.
///
/// Every mutation goes through one lock, and change events are sent
/// while the lock is held, so observers see events in mutation order.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    processes: IndexMap<String, Process>,
    snapshot: Snapshot,
    observers: Vec<flume::Sender<RegistryEvent>>,
}

impl Inner {
    fn commit(&mut self, event: RegistryEvent) {
        self.snapshot = Arc::new(self.processes.values().cloned().collect());
        self.observers
            .retain(|observer| observer.send(event.clone()).is_ok());
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer that receives every subsequent change.
    pub fn subscribe(&self) -> flume::Receiver<RegistryEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.lock().observers.push(tx);
        rx
    }

    /// Adds a process. A name already present is rejected without
    /// touching the existing entry.
    pub fn add(&self, process: Process) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();

        if inner.processes.contains_key(&process.name) {
            return Err(RegistryError::DuplicateName(process.name));
        }

        debug!(process = %process.name, "Registry add");
        inner
            .processes
            .insert(process.name.clone(), process.clone());
        inner.commit(RegistryEvent::Added(process));
        Ok(())
    }

    /// Adds a process, atomically swapping out an entry with the same
    /// name. Returns the replaced entry.
    ///
    /// A swap emits `Removed(old)` followed by `Added(new)`.
    pub fn replace(&self, process: Process) -> Option<Process> {
        let mut inner = self.inner.lock();

        let old = inner.processes.shift_remove(&process.name);
        if let Some(old) = &old {
            inner.commit(RegistryEvent::Removed(old.clone()));
        }

        inner
            .processes
            .insert(process.name.clone(), process.clone());
        inner.commit(RegistryEvent::Added(process));
        old
    }

    pub fn remove(&self, name: &str) -> Result<Process, RegistryError> {
        let mut inner = self.inner.lock();

        let Some(process) = inner.processes.shift_remove(name) else {
            return Err(RegistryError::NotFound(name.to_string()));
        };

        debug!(process = %name, "Registry remove");
        inner.commit(RegistryEvent::Removed(process.clone()));
        Ok(process)
    }

    /// Removes a process if present. A missing name is logged, not an error.
    pub fn try_remove(&self, name: &str) -> Option<Process> {
        match self.remove(name) {
            Ok(process) => Some(process),
            Err(err) => {
                warn!(process = %name, error = %err, "Nothing to remove");
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Process> {
        self.inner.lock().processes.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().processes.contains_key(name)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().snapshot.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().processes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::StreamDescriptor;
    use std::collections::HashSet;

    fn process(name: &str) -> Process {
        Process::new(
            name,
            vec![Endpoint::TcpSource {
                host: "127.0.0.1".into(),
                port: 9000,
                stream: StreamDescriptor::new("Audio", "audio"),
            }],
        )
    }

    #[test]
    fn test_add_then_snapshot() {
        let registry = Registry::new();
        registry.add(process("a")).unwrap();
        registry.add(process("b")).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "a");
        assert_eq!(snapshot[1].name, "b");
    }

    #[test]
    fn test_duplicate_add_leaves_entry_untouched() {
        let registry = Registry::new();
        registry.add(process("a").with_version("v1")).unwrap();

        let err = registry.add(process("a").with_version("v2")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName("a".into()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().version.as_deref(), Some("v1"));
    }

    #[test]
    fn test_replace_swaps_entry() {
        let registry = Registry::new();
        let events = registry.subscribe();
        registry.add(process("a").with_version("v1")).unwrap();

        let old = registry.replace(process("a").with_version("v2")).unwrap();
        assert_eq!(old.version.as_deref(), Some("v1"));
        assert_eq!(registry.get("a").unwrap().version.as_deref(), Some("v2"));

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                RegistryEvent::Added(process("a").with_version("v1")),
                RegistryEvent::Removed(process("a").with_version("v1")),
                RegistryEvent::Added(process("a").with_version("v2")),
            ]
        );
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let registry = Registry::new();
        assert_eq!(
            registry.remove("ghost").unwrap_err(),
            RegistryError::NotFound("ghost".into())
        );
        assert!(registry.try_remove("ghost").is_none());
    }

    #[test]
    fn test_one_event_per_mutation_in_order() {
        let registry = Registry::new();
        let first = registry.subscribe();
        let second = registry.subscribe();

        registry.add(process("a")).unwrap();
        registry.add(process("b")).unwrap();
        let _ = registry.add(process("a"));
        registry.remove("a").unwrap();
        let _ = registry.remove("a");

        let expected = vec![
            RegistryEvent::Added(process("a")),
            RegistryEvent::Added(process("b")),
            RegistryEvent::Removed(process("a")),
        ];
        assert_eq!(first.try_iter().collect::<Vec<_>>(), expected);
        assert_eq!(second.try_iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_dropped_observer_is_pruned() {
        let registry = Registry::new();
        drop(registry.subscribe());
        let live = registry.subscribe();

        registry.add(process("a")).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(registry.inner.lock().observers.len(), 1);
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let registry = Registry::new();
        registry.add(process("a")).unwrap();
        let before = registry.snapshot();

        registry.add(process("b")).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_random_add_remove_sequences() {
        // Deterministic pseudo-random walk over a small name space.
        let names = ["a", "b", "c", "d", "e"];
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..50 {
            let registry = Registry::new();
            let mut model: HashSet<&str> = HashSet::new();

            for _ in 0..40 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let name = names[(seed % names.len() as u64) as usize];

                if seed & 0x100 == 0 {
                    let result = registry.add(process(name));
                    assert_eq!(result.is_ok(), model.insert(name));
                } else {
                    let result = registry.remove(name);
                    assert_eq!(result.is_ok(), model.remove(name));
                }
            }

            let snapshot = registry.snapshot();
            let mut seen = HashSet::new();
            for process in snapshot.iter() {
                assert!(seen.insert(process.name.as_str()), "duplicate name");
            }
            assert_eq!(seen, model);
        }
    }

    #[test]
    fn test_wire_process_with_unknown_endpoint_is_rejected() {
        let json = r#"{
            "name": "capture",
            "version": "v1",
            "endpoints": [
                {"kind": "tcp_source", "host": "h", "port": 1, "stream": {"name": "Audio", "type_tag": "audio"}},
                {"kind": "carrier_pigeon"}
            ]
        }"#;
        let wire: WireProcess = serde_json::from_str(json).unwrap();

        match Process::try_from(wire) {
            Err(ProtocolError::RejectedProcess { name, source }) => {
                assert_eq!(name, "capture");
                assert!(matches!(*source, ProtocolError::UnknownEndpointKind));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
