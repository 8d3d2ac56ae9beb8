//! TOML configuration for the ringway daemon.
//!
//! Every section is optional; missing keys take the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ringway_net::{DEFAULT_MAX_FRAME_LENGTH, MsgRingConfig};
use ringway_placement::NodeId;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Ring files and local identity.
    pub node: NodeSection,
    /// Connection tuning.
    pub transport: TransportSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Ring file used by `build`, `show` and `serve`.
    pub ring_path: PathBuf,
    /// Builder file used by `create`, `add-node`, `remove-node` and `build`.
    pub builder_path: PathBuf,
    /// ID of this node in the ring.
    pub local_node: Option<NodeId>,
    /// Listen address override. Defaults to the local node's first address.
    pub listen_addr: Option<String>,
    /// Message types `serve` accepts and logs.
    pub msg_types: Vec<u64>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            ring_path: PathBuf::from("ringway.ring"),
            builder_path: PathBuf::from("ringway.builder"),
            local_node: None,
            listen_addr: None,
            msg_types: Vec::new(),
        }
    }
}

/// `[transport]` section. Timeouts are in milliseconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Per-connection read and write buffer size in bytes.
    pub buffer_size: usize,
    /// Largest inbound frame content accepted, in bytes.
    pub max_frame_length: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            read_timeout_ms: 60_000,
            write_timeout_ms: 2_000,
            connect_timeout_ms: 2_000,
            buffer_size: 16 * 1024,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl TransportSection {
    pub fn msg_ring_config(&self) -> MsgRingConfig {
        MsgRingConfig {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            buffer_size: self.buffer_size,
            max_frame_length: self.max_frame_length,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
