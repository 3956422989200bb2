//! Length-delimited JSON framing shared by every TCP link in the system.
//!
//! Rendezvous messages, stream sources, heartbeats and published
//! perceptions all travel as one JSON document per frame.

use crate::registry::RegistryError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound on a single frame. Raw video frames are the largest payload.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// A TCP connection speaking length-delimited frames.
pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Errors raised while talking to a peer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown endpoint kind")]
    UnknownEndpointKind,

    #[error("process {name} rejected: {source}")]
    RejectedProcess {
        name: String,
        #[source]
        source: Box<ProtocolError>,
    },

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("refused by the rendezvous server: {0}")]
    Refused(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("timed out after {timeout:?} connecting to {addr}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("connection to the rendezvous server was lost")]
    ConnectionLost,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error invalidates every session depending on the link.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::ConnectionLost)
    }
}

/// One published record: a payload tagged with topic and originating time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub topic: String,
    pub timestamp: Duration,
    pub payload: T,
}

pub fn framed(stream: TcpStream) -> FramedStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode<T>(message: &T) -> Result<Bytes, ProtocolError>
where
    T: Serialize + ?Sized,
{
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T>(bytes: &[u8]) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
{
    Ok(serde_json::from_slice(bytes)?)
}

/// Sends one message as a frame.
pub async fn send<T>(conn: &mut FramedStream, message: &T) -> Result<(), ProtocolError>
where
    T: Serialize + ?Sized,
{
    conn.send(encode(message)?).await?;
    Ok(())
}

/// Receives the next message. Returns `None` once the peer hung up.
pub async fn recv<T>(conn: &mut FramedStream) -> Result<Option<T>, ProtocolError>
where
    T: DeserializeOwned,
{
    match conn.next().await {
        Some(frame) => Ok(Some(decode(&frame?)?)),
        None => Ok(None),
    }
}

/// Opens a TCP connection, failing instead of hanging past `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, ProtocolError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::ConnectTimeout {
            addr: addr.to_string(),
            timeout,
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Converts a `tcp://host:port` address into a socket address to bind.
///
/// `*` binds every interface.
pub fn bind_address(address: &str) -> Result<String, ProtocolError> {
    let (host, port) = split_address(address)?;
    let host = if host == "*" { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

/// Converts a `tcp://host:port` address into a socket address to dial.
///
/// Wildcard and unspecified hosts are replaced by `fallback_host`.
pub fn dial_address(address: &str, fallback_host: &str) -> Result<String, ProtocolError> {
    let (host, port) = split_address(address)?;
    Ok(format!("{}:{port}", resolve_host(host, fallback_host)))
}

/// Replaces a wildcard host with a reachable one.
pub fn resolve_host<'a>(host: &'a str, fallback_host: &'a str) -> &'a str {
    match host {
        "*" | "0.0.0.0" | "" => fallback_host,
        host => host,
    }
}

fn split_address(address: &str) -> Result<(&str, u16), ProtocolError> {
    let rest = address.strip_prefix("tcp://").unwrap_or(address);
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| ProtocolError::InvalidAddress(address.to_string()))?;
    let port = port
        .parse()
        .map_err(|_| ProtocolError::InvalidAddress(address.to_string()))?;
    Ok((host, port))
}
