use conduit::net::endpoint::CommConfig;
use flint::identity::IdentityKey;
use serde_derive::{Deserialize, Serialize};
use sloggers::LoggerConfig;
use std::path::Path;
use std::time::Duration;

/// The `[communicator]` section of the daemon configuration.
#[derive(Serialize, Deserialize)]
pub struct CommunicatorSection {
    /// Bind specifications: `tcp-HOST:PORT`, `HOST:PORT` or a bare port.
    pub bindto: Vec<String>,
    /// Base64 encoding of the 32-byte long-term identity seed.
    pub private_key: IdentityKey,
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: u32,
    #[serde(default = "default_rekey_interval_secs")]
    pub rekey_interval_secs: u64,
    #[serde(default = "default_rekey_max_bytes")]
    pub rekey_max_bytes: u64,
    #[serde(default)]
    pub disable_v6: bool,
}

fn default_max_queue_length() -> u32 {
    8
}

fn default_rekey_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_rekey_max_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

#[derive(Serialize, Deserialize)]
pub struct Config {
    pub communicator: CommunicatorSection,
    #[serde(default = "flint::logging::default_config")]
    pub logging: LoggerConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    pub fn comm_config(&self) -> CommConfig {
        CommConfig {
            max_queue_length: self.communicator.max_queue_length,
            rekey_interval: Duration::from_secs(self.communicator.rekey_interval_secs),
            rekey_max_bytes: self.communicator.rekey_max_bytes,
            ..CommConfig::default()
        }
    }
}
