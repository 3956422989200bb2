//! percepsync-node - the PercepSync hub executable.
//!
//! The `percepsync` binary runs a rendezvous server and a hub on top of
//! it. The hub waits for the configured capture process, subscribes to
//! its video and audio streams, and publishes paced perceptions on the
//! configured address.
//!
//! # Configuration
//!
//! A YAML file given with `--config-file` may set:
//! - `rendezvous`: listening host and port of the rendezvous server
//! - `target`: the capture process, its version and stream names
//! - `output`: publish address and topic of the perceptions
//! - `sync`: fps, playout delay, join windows and delivery policies
//! - `heartbeat`: period, timeout multiple and port of the beacon
//!
//! Every field has a default, so an empty file is valid. See
//! `config/example.yaml` for a complete example.
//!
//! The `synthetic-capture` binary is a capture peer that announces
//! generated video and audio, for exercising a hub without devices.

pub mod config;

pub use config::{NodeConfig, Overrides, RendezvousConfig};
