//! Opening the streams a capture process advertises.

use crate::{
    clock::{SystemClock, measure_offset},
    endpoint::{Endpoint, StreamDescriptor},
    publisher::Subscriber,
    types::{SensorPayload, TimestampedMessage},
    wire::ProtocolError,
};
use chrono::TimeDelta;
use futures::{
    FutureExt, StreamExt, TryStreamExt,
    future::BoxFuture,
    stream::BoxStream,
};
use std::time::Duration;

/// The messages of one remote stream, in the order they were sent.
pub type InboundStream =
    BoxStream<'static, Result<TimestampedMessage<SensorPayload>, ProtocolError>>;

/// Connects to the endpoints of a capture process.
pub trait SourceConnector: Send + Sync + 'static {
    /// Opens `stream` on `endpoint`, failing after `timeout`.
    fn open(
        &self,
        endpoint: &Endpoint,
        stream: &StreamDescriptor,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<InboundStream, ProtocolError>>;

    /// Measures how far the clock behind a `RemoteClockSource` runs ahead
    /// of the local clock.
    fn clock_offset(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<TimeDelta, ProtocolError>>;
}

/// Connects over TCP using the framed wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl SourceConnector for TcpConnector {
    fn open(
        &self,
        endpoint: &Endpoint,
        stream: &StreamDescriptor,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<InboundStream, ProtocolError>> {
        let address = match endpoint {
            Endpoint::TcpSource { host, port, .. } => format!("{host}:{port}"),
            Endpoint::PubSubSource { address, .. } => address.clone(),
            Endpoint::RemoteExporter { .. } | Endpoint::RemoteClockSource { .. } => {
                let err = ProtocolError::UnsupportedEndpoint(endpoint.to_string());
                return futures::future::ready(Err(err)).boxed();
            }
        };
        let topic = stream.name.clone();

        async move {
            let subscriber =
                Subscriber::<SensorPayload>::connect(&address, Some(&topic), timeout).await?;
            let messages = subscriber
                .into_stream()
                .map_ok(|envelope| TimestampedMessage::new(envelope.timestamp, envelope.payload))
                .boxed();
            Ok(messages)
        }
        .boxed()
    }

    fn clock_offset(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<TimeDelta, ProtocolError>> {
        let Endpoint::RemoteClockSource { host, port } = endpoint else {
            let err = ProtocolError::UnsupportedEndpoint(endpoint.to_string());
            return futures::future::ready(Err(err)).boxed();
        };
        let address = format!("{host}:{port}");

        async move { measure_offset(&address, &SystemClock, timeout).await }.boxed()
    }
}
