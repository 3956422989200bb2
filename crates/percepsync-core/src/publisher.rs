//! Topic-tagged fan-out over TCP.
//!
//! A [FanoutPublisher] accepts any number of subscribers and forwards
//! every published record to each of them. A [Subscriber] connects to a
//! publisher and yields the records carrying its topic.
//!
//! With [DeliveryPolicy::LatestOnly] each subscriber holds a bounded
//! backlog and a slow one loses its oldest records. With
//! [DeliveryPolicy::Unlimited] each subscriber gets its own unbounded
//! queue and nothing is dropped.

use crate::{
    config::DeliveryPolicy,
    types::Perception,
    wire::{self, Envelope, FramedStream, ProtocolError},
};
use bytes::Bytes;
use futures::{
    SinkExt,
    stream::{self, BoxStream, StreamExt},
};
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use std::{marker::PhantomData, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, watch},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of records a slow subscriber of a lossy publisher may fall
/// behind before it starts losing records.
const SUBSCRIBER_BACKLOG: usize = 64;

/// Where published frames go.
#[derive(Clone)]
enum Fanout {
    Lossy(broadcast::Sender<Bytes>),
    Queued(Arc<Mutex<Vec<mpsc::UnboundedSender<Bytes>>>>),
}

impl Fanout {
    fn new(policy: DeliveryPolicy) -> Self {
        match policy {
            DeliveryPolicy::LatestOnly => Fanout::Lossy(broadcast::channel(SUBSCRIBER_BACKLOG).0),
            DeliveryPolicy::Unlimited => Fanout::Queued(Arc::default()),
        }
    }

    fn subscribe(&self) -> Outlet {
        match self {
            Fanout::Lossy(tx) => Outlet::Lossy(tx.subscribe()),
            Fanout::Queued(queues) => {
                let (tx, rx) = mpsc::unbounded_channel();
                queues.lock().push(tx);
                Outlet::Queued(rx)
            }
        }
    }

    fn send(&self, frame: Bytes) -> usize {
        match self {
            // An error only means that nobody is listening.
            Fanout::Lossy(tx) => tx.send(frame).unwrap_or(0),
            Fanout::Queued(queues) => {
                let mut queues = queues.lock();
                queues.retain(|queue| queue.send(frame.clone()).is_ok());
                queues.len()
            }
        }
    }
}

/// The receiving end of one subscriber's share of a [Fanout].
enum Outlet {
    Lossy(broadcast::Receiver<Bytes>),
    Queued(mpsc::UnboundedReceiver<Bytes>),
}

impl Outlet {
    /// The next frame, or `None` once the publisher is gone.
    async fn recv(&mut self) -> Option<Bytes> {
        match self {
            Outlet::Queued(rx) => rx.recv().await,
            Outlet::Lossy(rx) => loop {
                match rx.recv().await {
                    Ok(frame) => return Some(frame),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscriber lagged, records dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

/// Publishes records of type `T` to every connected subscriber.
pub struct FanoutPublisher<T> {
    fanout: Fanout,
    local_addr: SocketAddr,
    subscribers: watch::Receiver<usize>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    _marker: PhantomData<fn(&T)>,
}

impl<T> FanoutPublisher<T>
where
    T: Serialize,
{
    /// Binds a lossy publisher on a `tcp://host:port` address. `*` binds
    /// every interface and port 0 picks a free port.
    pub async fn bind(address: &str) -> Result<Self, ProtocolError> {
        Self::bind_with_policy(address, DeliveryPolicy::LatestOnly).await
    }

    /// Binds a publisher delivering according to `policy`.
    pub async fn bind_with_policy(
        address: &str,
        policy: DeliveryPolicy,
    ) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(wire::bind_address(address)?).await?;
        let local_addr = listener.local_addr()?;
        let fanout = Fanout::new(policy);
        let (count_tx, count_rx) = watch::channel(0usize);
        let cancel = CancellationToken::new();

        let accept_task = tokio::spawn({
            let fanout = fanout.clone();
            let cancel = cancel.clone();
            async move {
                let mut connections = JoinSet::new();
                loop {
                    let (socket, peer) = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok(accepted) => accepted,
                            Err(err) => {
                                warn!(error = %err, "Publisher failed to accept");
                                continue;
                            }
                        },
                        // Reap finished connections.
                        Some(_) = connections.join_next(), if !connections.is_empty() => continue,
                    };

                    if let Err(err) = socket.set_nodelay(true) {
                        debug!(peer = %peer, error = %err, "Unable to disable Nagle");
                    }

                    // Subscribe before counting so that a caller woken by
                    // the count never publishes into the void.
                    let outlet = fanout.subscribe();
                    count_tx.send_modify(|count| *count += 1);
                    debug!(peer = %peer, "Subscriber connected");

                    let count_tx = count_tx.clone();
                    let cancel = cancel.clone();
                    connections.spawn(async move {
                        forward(wire::framed(socket), outlet, cancel).await;
                        count_tx.send_modify(|count| *count = count.saturating_sub(1));
                        debug!(peer = %peer, "Subscriber disconnected");
                    });
                }

                drop(listener);
                while connections.join_next().await.is_some() {}
            }
        });

        Ok(Self {
            fanout,
            local_addr,
            subscribers: count_rx,
            cancel,
            accept_task: Mutex::new(Some(accept_task)),
            _marker: PhantomData,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publishes one record under `topic`. Returns the number of
    /// subscribers it was queued for.
    pub fn publish(
        &self,
        topic: &str,
        timestamp: Duration,
        payload: &T,
    ) -> Result<usize, ProtocolError> {
        let frame = wire::encode(&Envelope {
            topic: topic.to_string(),
            timestamp,
            payload,
        })?;
        Ok(self.fanout.send(frame))
    }

    pub fn subscriber_count(&self) -> usize {
        *self.subscribers.borrow()
    }

    /// Waits until at least `count` subscribers are connected.
    pub async fn wait_for_subscribers(&self, count: usize, timeout: Duration) -> bool {
        let mut subscribers = self.subscribers.clone();
        tokio::time::timeout(timeout, subscribers.wait_for(|current| *current >= count))
            .await
            .is_ok_and(|result| result.is_ok())
    }
}

impl<T> FanoutPublisher<T> {
    /// Stops accepting subscribers and disconnects the existing ones.
    ///
    /// Returns once the listening socket and every subscriber connection
    /// are released, so the address can be bound again right away.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "Publisher task failed");
        }
    }
}

impl<T> Drop for FanoutPublisher<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn forward(mut conn: FramedStream, mut outlet: Outlet, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outlet.recv() => frame,
            // Subscribers never send; a readable socket means it closed.
            _ = conn.next() => break,
        };

        let Some(frame) = frame else { break };
        if conn.send(frame).await.is_err() {
            break;
        }
    }
}

/// Receives the records of one topic from a [FanoutPublisher].
pub struct Subscriber<T> {
    conn: FramedStream,
    topic: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

/// A subscriber to the synchronized output stream.
pub type PerceptionSubscriber = Subscriber<Perception>;

impl<T> Subscriber<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Connects to a publisher. With `topic` set, records of other topics
    /// are skipped.
    pub async fn connect(
        address: &str,
        topic: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let addr = wire::dial_address(address, "127.0.0.1")?;
        let conn = wire::framed(wire::connect(&addr, timeout).await?);

        Ok(Self {
            conn,
            topic: topic.map(str::to_string),
            _marker: PhantomData,
        })
    }

    /// Returns the next matching record, or `None` once the publisher
    /// hung up.
    pub async fn next(&mut self) -> Result<Option<Envelope<T>>, ProtocolError> {
        loop {
            let Some(envelope) = wire::recv::<Envelope<T>>(&mut self.conn).await? else {
                return Ok(None);
            };

            match &self.topic {
                Some(topic) if *topic != envelope.topic => continue,
                _ => return Ok(Some(envelope)),
            }
        }
    }

    /// Converts the subscriber into a stream ending after the first error
    /// or once the publisher hung up.
    pub fn into_stream(self) -> BoxStream<'static, Result<Envelope<T>, ProtocolError>> {
        stream::unfold(Some(self), |subscriber| async move {
            let mut subscriber = subscriber?;
            match subscriber.next().await {
                Ok(Some(envelope)) => Some((Ok(envelope), Some(subscriber))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }
}
