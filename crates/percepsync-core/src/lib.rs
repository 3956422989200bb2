//! This library discovers a perception capture peer over a rendezvous
//! server, subscribes to its video and audio streams, and paces them
//! into a fixed-rate stream of joined perceptions.
//!
//! # Usage
//!
//! ```rust
//! use bytes::Bytes;
//! use futures::StreamExt;
//! use percepsync_core::{
//!     AudioChunk, Clock, DeliveryPolicy, ImageFrame, SyncConfig, SyncInputs, SystemClock,
//!     TimestampedMessage, edge, sync,
//! };
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> eyre::Result<()> {
//! let config = SyncConfig {
//!     fps: 50.0,
//!     playout_delay: Duration::ZERO,
//!     join_window: Some(Duration::from_secs(1)),
//!     ..SyncConfig::default()
//! };
//!
//! // One edge per producer
//! let (video_tx, video) = edge(DeliveryPolicy::LatestOnly);
//! let (audio_tx, audio) = edge(DeliveryPolicy::Unlimited);
//!
//! let (mut perceptions, _stats) = sync(
//!     SyncInputs {
//!         video,
//!         audio,
//!         transcript: None,
//!     },
//!     &config,
//!     SystemClock,
//! )?;
//!
//! // Samples timestamped with the shared clock
//! let now = SystemClock.now();
//! let frame = ImageFrame {
//!     width: 1,
//!     height: 1,
//!     stride: 4,
//!     pixel_data: Bytes::from_static(&[0, 0, 0, 255]),
//! };
//! video_tx.push(TimestampedMessage::new(now, frame));
//! audio_tx.push(TimestampedMessage::new(now, AudioChunk::new(vec![0u8; 640])));
//!
//! let perception = perceptions.next().await;
//! assert!(perception.is_some());
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod capture;
pub mod clock;
mod config;
pub mod edge;
pub mod endpoint;
pub mod heartbeat;
mod hub;
pub mod lifecycle;
pub mod publisher;
pub mod reframe;
pub mod registry;
pub mod rendezvous;
pub mod session;
pub mod source;
pub mod speech;
pub mod state;
mod sync;
mod types;
pub mod wire;

pub use capture::{CaptureConfig, CapturePeer, StreamSpec};
pub use clock::{Clock, OffsetClock, SystemClock};
pub use config::{Config, DeliveryPolicy, OutputConfig, SyncConfig, TargetConfig};
pub use edge::{EdgeReceiver, EdgeSender, edge};
pub use endpoint::{Endpoint, StreamDescriptor};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, Liveness};
pub use hub::Hub;
pub use lifecycle::{LifecycleState, TeardownReason};
pub use publisher::{FanoutPublisher, PerceptionSubscriber, Subscriber};
pub use registry::{Process, Registry};
pub use rendezvous::{RendezvousClient, RendezvousEvent, RendezvousServer};
pub use session::{Session, SessionError};
pub use source::{SourceConnector, TcpConnector};
pub use speech::Transcriber;
pub use state::SyncStats;
pub use sync::{SyncInputs, sync};
pub use types::*;
pub use wire::ProtocolError;
