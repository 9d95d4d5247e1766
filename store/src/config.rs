//! Configuration for a store node.
//!
//! A node is configured from an optional YAML file deserialized into
//! [`Config`]; every field has a default so an empty file (or no file) is a
//! valid single-node, file-backed setup. Command-line flags are applied on top
//! by the binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::peer::{Peer, PeerType};

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Port the HTTP API listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local storage engine.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cluster membership.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Upper bound on each internal query sent to a peer.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// How often a multiplexed stream re-reads cluster membership.
    #[serde(default = "default_stream_refresh_interval_ms")]
    pub stream_refresh_interval_ms: u64,

    /// Records buffered between peer sub-streams and a client stream.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

fn default_port() -> u16 {
    7650
}

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_stream_refresh_interval_ms() -> u64 {
    1_000
}

fn default_stream_buffer() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            storage: StorageConfig::default(),
            cluster: ClusterConfig::default(),
            query_timeout_ms: default_query_timeout_ms(),
            stream_refresh_interval_ms: default_stream_refresh_interval_ms(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl Config {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn stream_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.stream_refresh_interval_ms)
    }

    /// Address other nodes use to reach this one.
    ///
    /// Falls back to `127.0.0.1:<port>` when none is configured.
    pub fn advertise_addr(&self) -> String {
        self.cluster
            .advertise_addr
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.port))
    }

    /// Checks settings that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.stream_refresh_interval_ms == 0 {
            return Err(Error::InvalidInput(
                "stream_refresh_interval_ms must be positive".to_string(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(Error::InvalidInput(
                "stream_buffer must be positive".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "query_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Storage engine configuration.
///
/// Defaults to a file store in `./data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// Keep segments in memory. Nothing survives a restart.
    InMemory,
    /// Keep one file per segment in a local directory.
    File(FileStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File(FileStorageConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Directory holding segment files. Created if missing.
    pub path: String,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            path: "data".to_string(),
        }
    }
}

/// Static cluster membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// `host:port` other nodes use to reach this node.
    #[serde(default)]
    pub advertise_addr: Option<String>,

    /// Role of this node.
    #[serde(default = "default_role")]
    pub role: PeerType,

    /// Other members of the cluster.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

fn default_role() -> PeerType {
    PeerType::Store
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            advertise_addr: None,
            role: default_role(),
            peers: Vec::new(),
        }
    }
}

/// A configured cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub addr: String,
    #[serde(default = "default_role")]
    pub role: PeerType,
}

impl From<&PeerConfig> for Peer {
    fn from(config: &PeerConfig) -> Self {
        Peer::new(config.addr.clone(), config.role)
    }
}

/// Loads configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())
        .map_err(|e| Error::InvalidInput(format!("Failed to read config file: {}", e)))?;

    serde_yaml::from_str(&contents)
        .map_err(|e| Error::InvalidInput(format!("Failed to parse config file: {}", e)))
}
