//! percepsync hub entry point.

use clap::Parser;
use eyre::{Result, WrapErr};
use percepsync_core::{Hub, Registry, RendezvousServer, TcpConnector};
use percepsync_node::{NodeConfig, Overrides};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Discovers a capture peer and publishes synchronized perceptions.
#[derive(Debug, Parser)]
#[command(name = "percepsync", version)]
struct Args {
    /// YAML configuration file.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Port of the rendezvous server.
    #[arg(long)]
    rdzv_server_port: Option<u16>,

    /// Address perceptions are published on, e.g. tcp://*:12345.
    #[arg(long)]
    percep_stream_address: Option<String>,

    /// Perceptions per second.
    #[arg(long)]
    fps: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config_file {
        Some(path) => {
            info!(config_file = %path.display(), "Loading configuration");
            NodeConfig::load(path)?
        }
        None => NodeConfig::default(),
    };
    config.apply(Overrides {
        rendezvous_port: args.rdzv_server_port,
        perception_address: args.percep_stream_address,
        fps: args.fps,
    });
    config.validate()?;

    info!(
        rendezvous = %config.rendezvous.address(),
        process = %config.hub.target.process,
        output = %config.hub.output.address,
        fps = config.hub.sync.fps,
        playout_delay = ?config.hub.sync.playout_delay,
        "Configuration loaded"
    );

    let registry = Arc::new(Registry::new());
    let server = RendezvousServer::bind(&config.rendezvous.address(), registry.clone())
        .await
        .wrap_err("Failed to start the rendezvous server")?;

    let shutdown = CancellationToken::new();
    let hub = Hub::new(config.hub, registry, TcpConnector);
    let mut hub_task = tokio::spawn(hub.run(server.events(), shutdown.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.wrap_err("Failed to listen for ctrl-c")?;
            info!("Interrupted, shutting down");
            shutdown.cancel();
            match hub_task.await {
                Ok(result) => result?,
                Err(err) => error!(error = %err, "Hub task failed"),
            }
        }
        result = &mut hub_task => {
            match result {
                Ok(result) => result?,
                Err(err) => error!(error = %err, "Hub task failed"),
            }
        }
    }

    server.shutdown().await;
    info!("percepsync shutting down");
    Ok(())
}
