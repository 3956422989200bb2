//! Configuration parsing and validation for the hub executable.

use eyre::{Result, WrapErr, ensure};
use percepsync_core::Config;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Root configuration structure.
///
/// Hub settings sit at the top level next to the rendezvous server
/// settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Rendezvous server settings.
    pub rendezvous: RendezvousConfig,

    #[serde(flatten)]
    pub hub: Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Interface the server listens on.
    pub host: String,
    pub port: u16,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            host: "*".into(),
            port: 13331,
        }
    }
}

impl RendezvousConfig {
    pub fn address(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Values given on the command line, applied over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rendezvous_port: Option<u16>,
    pub perception_address: Option<String>,
    pub fps: Option<f64>,
}

impl NodeConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file: {}", path.display()))?;

        let config: NodeConfig = serde_yaml::from_str(&contents)
            .wrap_err_with(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(port) = overrides.rendezvous_port {
            self.rendezvous.port = port;
        }
        if let Some(address) = overrides.perception_address {
            self.hub.output.address = address;
        }
        if let Some(fps) = overrides.fps {
            self.hub.sync.fps = fps;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.rendezvous.host.is_empty(),
            "rendezvous.host cannot be empty"
        );
        self.hub.validate()
    }
}
