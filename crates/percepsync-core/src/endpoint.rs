//! Typed descriptions of network-reachable stream sources.

use crate::wire::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named stream served by an endpoint.
///
/// The type tag is informational: it is used for display and routing,
/// never for payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
    pub type_tag: String,
}

impl StreamDescriptor {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
        }
    }

    /// The type tag up to the first comma, dropping assembly qualifiers.
    pub fn short_type(&self) -> &str {
        self.type_tag.split(',').next().unwrap_or_default().trim()
    }
}

/// Discriminant of [Endpoint], part of an endpoint's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    TcpSource,
    PubSubSource,
    RemoteExporter,
    RemoteClockSource,
}

/// A network location plus the streams it serves. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    TcpSource {
        host: String,
        port: u16,
        stream: StreamDescriptor,
    },
    PubSubSource {
        address: String,
        streams: Vec<StreamDescriptor>,
    },
    RemoteExporter {
        host: String,
        port: u16,
        transport: String,
        streams: Vec<StreamDescriptor>,
    },
    RemoteClockSource {
        host: String,
        port: u16,
    },
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::TcpSource { .. } => EndpointKind::TcpSource,
            Endpoint::PubSubSource { .. } => EndpointKind::PubSubSource,
            Endpoint::RemoteExporter { .. } => EndpointKind::RemoteExporter,
            Endpoint::RemoteClockSource { .. } => EndpointKind::RemoteClockSource,
        }
    }

    /// Identity of the endpoint: its kind plus `host:port` or address.
    pub fn identity(&self) -> (EndpointKind, String) {
        let location = match self {
            Endpoint::TcpSource { host, port, .. }
            | Endpoint::RemoteExporter { host, port, .. }
            | Endpoint::RemoteClockSource { host, port } => format!("{host}:{port}"),
            Endpoint::PubSubSource { address, .. } => address.clone(),
        };
        (self.kind(), location)
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        match self {
            Endpoint::TcpSource { stream, .. } => std::slice::from_ref(stream),
            Endpoint::PubSubSource { streams, .. } | Endpoint::RemoteExporter { streams, .. } => {
                streams
            }
            Endpoint::RemoteClockSource { .. } => &[],
        }
    }

    pub fn stream(&self, name: &str) -> Option<&StreamDescriptor> {
        self.streams().iter().find(|stream| stream.name == name)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::TcpSource { host, port, .. } => write!(f, "TCP {host} {port}"),
            Endpoint::PubSubSource { address, .. } => write!(f, "PubSub {address}"),
            Endpoint::RemoteExporter {
                host,
                port,
                transport,
                ..
            } => write!(f, "Remote {host} {port} {transport}"),
            Endpoint::RemoteClockSource { host, port } => write!(f, "Remote Clock {host} {port}"),
        }
    }
}

/// Serialized form of [Endpoint].
///
/// Records whose `kind` tag is not recognized decode to
/// [WireEndpoint::Unknown] and are rejected when converted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireEndpoint {
    TcpSource {
        host: String,
        port: u16,
        stream: StreamDescriptor,
    },
    PubSubSource {
        address: String,
        streams: Vec<StreamDescriptor>,
    },
    RemoteExporter {
        host: String,
        port: u16,
        transport: String,
        #[serde(default)]
        streams: Vec<StreamDescriptor>,
    },
    RemoteClockSource {
        host: String,
        port: u16,
    },
    #[serde(other)]
    Unknown,
}

impl TryFrom<WireEndpoint> for Endpoint {
    type Error = ProtocolError;

    fn try_from(wire: WireEndpoint) -> Result<Self, Self::Error> {
        let endpoint = match wire {
            WireEndpoint::TcpSource { host, port, stream } => {
                Endpoint::TcpSource { host, port, stream }
            }
            WireEndpoint::PubSubSource { address, streams } => {
                Endpoint::PubSubSource { address, streams }
            }
            WireEndpoint::RemoteExporter {
                host,
                port,
                transport,
                streams,
            } => Endpoint::RemoteExporter {
                host,
                port,
                transport,
                streams,
            },
            WireEndpoint::RemoteClockSource { host, port } => {
                Endpoint::RemoteClockSource { host, port }
            }
            WireEndpoint::Unknown => return Err(ProtocolError::UnknownEndpointKind),
        };
        Ok(endpoint)
    }
}

impl From<&Endpoint> for WireEndpoint {
    fn from(endpoint: &Endpoint) -> Self {
        match endpoint.clone() {
            Endpoint::TcpSource { host, port, stream } => {
                WireEndpoint::TcpSource { host, port, stream }
            }
            Endpoint::PubSubSource { address, streams } => {
                WireEndpoint::PubSubSource { address, streams }
            }
            Endpoint::RemoteExporter {
                host,
                port,
                transport,
                streams,
            } => WireEndpoint::RemoteExporter {
                host,
                port,
                transport,
                streams,
            },
            Endpoint::RemoteClockSource { host, port } => {
                WireEndpoint::RemoteClockSource { host, port }
            }
        }
    }
}
